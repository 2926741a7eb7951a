//! In-memory implementation of the service contracts, used by tests across the workspace.

use std::sync::{
    Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use chrono::Utc;

use crate::{
    matching,
    model::{Action, Constraint, Event, Labels},
    service::*,
};

#[derive(Debug, Default)]
pub struct MemoryServer {
    constraints: Mutex<Vec<Constraint>>,
    actions: Mutex<Vec<Action>>,
    events: Mutex<Vec<Event>>,
    unavailable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constraints(self, constraints: Vec<Constraint>) -> Self {
        *lock(&self.constraints) = constraints;
        self
    }

    pub fn with_actions(self, actions: Vec<Action>) -> Self {
        *lock(&self.actions) = actions;
        self
    }

    /// Make every call fail with [`ServiceError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn constraints(&self) -> Vec<Constraint> {
        lock(&self.constraints).clone()
    }

    pub fn actions(&self) -> Vec<Action> {
        lock(&self.actions).clone()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ServiceError::Unavailable("memory server is down".to_string()))
        } else {
            Ok(())
        }
    }
}

fn namespace_matches(filter: &Option<String>, namespace: &str) -> bool {
    filter.as_deref().is_none_or(|ns| ns.is_empty() || ns == namespace)
}

fn labels_of(request_labels: &[crate::model::MatchLabel]) -> Labels {
    request_labels
        .iter()
        .map(|label| (label.key.clone(), label.value.clone()))
        .collect()
}

impl ConfigService for MemoryServer {
    async fn get_constraints(
        &self,
        request: GetConstraintsRequest,
    ) -> Result<GetConstraintsResponse, ServiceError> {
        self.check_available()?;
        let labels = labels_of(&request.labels);
        let constraints = lock(&self.constraints)
            .iter()
            .filter(|c| namespace_matches(&request.namespace, &c.namespace))
            .filter(|c| {
                labels.is_empty()
                    || matching::action_selector_matches_pod_labels(c.selector.as_ref(), &labels)
            })
            .cloned()
            .collect();
        Ok(GetConstraintsResponse { constraints })
    }

    async fn add_constraint(
        &self,
        request: AddConstraintRequest,
    ) -> Result<AddConstraintResponse, ServiceError> {
        self.check_available()?;
        let mut constraints = lock(&self.constraints);
        if constraints.iter().any(|c| {
            c.namespace == request.constraint.namespace && c.name == request.constraint.name
        }) {
            return Err(ServiceError::InvalidArgument(format!(
                "constraint {} already exists",
                request.constraint.name
            )));
        }
        constraints.push(request.constraint);
        Ok(AddConstraintResponse { success: true })
    }

    async fn remove_constraint(
        &self,
        request: RemoveConstraintRequest,
    ) -> Result<RemoveConstraintResponse, ServiceError> {
        self.check_available()?;
        let mut constraints = lock(&self.constraints);
        let before = constraints.len();
        constraints.retain(|c| !(c.namespace == request.namespace && c.name == request.name));
        if constraints.len() == before {
            return Err(ServiceError::NotFound(request.name));
        }
        Ok(RemoveConstraintResponse { success: true })
    }

    async fn get_actions(
        &self,
        request: GetActionsRequest,
    ) -> Result<GetActionsResponse, ServiceError> {
        self.check_available()?;
        let actions = lock(&self.actions)
            .iter()
            .filter(|a| namespace_matches(&request.namespace, &a.namespace))
            .cloned()
            .collect();
        Ok(GetActionsResponse { actions })
    }

    async fn add_action(&self, request: AddActionRequest) -> Result<AddActionResponse, ServiceError> {
        self.check_available()?;
        lock(&self.actions).push(request.action);
        Ok(AddActionResponse { success: true })
    }

    async fn remove_action(
        &self,
        request: RemoveActionRequest,
    ) -> Result<RemoveActionResponse, ServiceError> {
        self.check_available()?;
        let mut actions = lock(&self.actions);
        let before = actions.len();
        actions.retain(|a| !(a.namespace == request.namespace && a.name == request.name));
        Ok(RemoveActionResponse {
            success: actions.len() != before,
        })
    }
}

impl EventService for MemoryServer {
    async fn ingest_event(
        &self,
        request: IngestEventRequest,
    ) -> Result<IngestEventResponse, ServiceError> {
        self.check_available()?;
        let mut event = request.event;
        event.uid = uuid::Uuid::new_v4().to_string();
        event.server_timestamp = Some(Utc::now());
        lock(&self.events).push(event);
        Ok(IngestEventResponse { success: true })
    }

    async fn get_events(&self, request: GetEventsRequest) -> Result<GetEventsResponse, ServiceError> {
        self.check_available()?;
        let events = lock(&self.events);
        let limit = if request.limit == 0 {
            events.len()
        } else {
            request.limit as usize
        };
        let events = events
            .iter()
            .rev()
            .filter(|event| {
                request.namespace.is_none()
                    || event.targets.iter().any(|target| {
                        target
                            .pod
                            .as_ref()
                            .is_some_and(|pod| namespace_matches(&request.namespace, &pod.namespace))
                    })
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(GetEventsResponse { events })
    }
}
