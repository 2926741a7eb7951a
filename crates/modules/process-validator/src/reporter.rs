use std::time::Duration;

use vigil_core::{
    model::{Constraint, Event},
    pdk::ModuleName,
    service::{
        self, AddConstraintRequest, ConfigService, EventService, IngestEventRequest,
    },
};

/// Delivers events and registered constraints to the cluster agent.
///
/// Delivery is at most once: failures are logged and the item is dropped.
pub struct EventReporter<C> {
    name: ModuleName,
    client: C,
    timeout: Duration,
}

impl<C> EventReporter<C>
where
    C: ConfigService + EventService,
{
    pub fn new(name: ModuleName, client: C, timeout: Duration) -> Self {
        Self {
            name,
            client,
            timeout,
        }
    }

    /// Returns true when the event was ingested.
    pub async fn report(&self, event: Event) -> bool {
        let call = self.client.ingest_event(IngestEventRequest { event });
        match service::with_timeout(self.timeout, call).await {
            Ok(response) => {
                log::debug!(target: self.name, "ingest event response: {response:?}");
                response.success
            }
            Err(err) => {
                bpf_common::log_error(self.name, "error while reporting violation event", err);
                false
            }
        }
    }

    /// Returns true when the constraint was added.
    pub async fn register_constraint(&self, constraint: Constraint) -> bool {
        let call = self.client.add_constraint(AddConstraintRequest { constraint });
        match service::with_timeout(self.timeout, call).await {
            Ok(response) => {
                log::debug!(target: self.name, "add constraint response: {response:?}");
                response.success
            }
            Err(err) => {
                bpf_common::log_error(self.name, "error while registering process constraint", err);
                false
            }
        }
    }
}
