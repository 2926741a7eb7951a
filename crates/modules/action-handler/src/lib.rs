//! Enforcement engine of the cluster agent.
//!
//! Inbound events are queued to a single consumer which matches every target
//! pod against the cached actions. A matching action runs only if the event
//! is strictly newer than the live pod: events about a previous pod
//! generation, replayed or late, never trigger remediation.
//!
//! The only remediation is `delete-pod`. A successful deletion is reported
//! back as a `pod_deleted` event carrying the same pod identity.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use kube_client::PodApi;
use tokio::{sync::mpsc, task::JoinHandle};
use vigil_core::{
    PolicyCache, cache, matching,
    model::{Action, ActionType, EVENT_TYPE_POD_DELETED, Event, Pod, Target},
    pdk::{ModuleName, ShutdownSignal},
    service::{self, ConfigService, EventService, GetActionsRequest, IngestEventRequest},
};

pub const MODULE_NAME: ModuleName = "action-handler";
pub const INBOX_CAPACITY: usize = 4096;

const POD_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_POD_TIMEOUT: Duration = Duration::from_secs(120);
const INGEST_TIMEOUT: Duration = Duration::from_secs(10);
const GET_ACTIONS_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the engine consuming its inbox until `shutdown` fires.
pub fn start_action_handler<K, E>(
    handler: ActionHandler<K, E>,
    mut shutdown: ShutdownSignal,
) -> (ActionHandlerHandle, JoinHandle<()>)
where
    K: PodApi + 'static,
    E: EventService + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Event>(INBOX_CAPACITY);
    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        handler.process_event(&event).await;
                    }
                    None => break,
                },
            }
        }
        log::debug!(target: handler.name, "action handler stopped");
    });
    (ActionHandlerHandle { tx }, join_handle)
}

#[derive(Clone)]
pub struct ActionHandlerHandle {
    tx: mpsc::Sender<Event>,
}

impl ActionHandlerHandle {
    /// Queue `event`, waiting for room when the inbox is full.
    pub async fn queue_event(&self, event: Event) {
        log::trace!(target: MODULE_NAME, "event queued: {}", event.event_type);
        if self.tx.send(event).await.is_err() {
            log::warn!(target: MODULE_NAME, "action handler stopped, event dropped");
        }
    }

    /// Raw inbox sender, for producers living in crates unaware of the handler.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }
}

/// True when `target` carries what `action` reacts to.
pub fn action_event_fulfilled(action: &Action, target: &Target) -> bool {
    (action.on_violated_process && !target.violated_processes.is_empty())
        || (action.on_violated_file && !target.violated_files.is_empty())
        || (action.on_falco_alert
            && target
                .falco_alert
                .as_ref()
                .is_some_and(|alert| alert.priority <= action.falco_priority))
}

pub struct ActionHandler<K, E> {
    name: ModuleName,
    actions: Arc<PolicyCache<Action>>,
    pods: K,
    events: E,
}

impl<K, E> ActionHandler<K, E>
where
    K: PodApi,
    E: EventService,
{
    pub fn new(name: ModuleName, actions: Arc<PolicyCache<Action>>, pods: K, events: E) -> Self {
        Self {
            name,
            actions,
            pods,
            events,
        }
    }

    /// Run every matching action for every pod targeted by `event`.
    ///
    /// Returns the number of actions executed successfully.
    pub async fn process_event(&self, event: &Event) -> usize {
        let mut executed = 0;
        let actions = self.actions.snapshot();

        for target in &event.targets {
            let Some(pod) = &target.pod else {
                continue;
            };
            let pod_labels = pod.label_map();

            for action in actions.iter() {
                if !action_event_fulfilled(action, target)
                    || !matching::action_matches_pod(action, &pod.namespace, &pod_labels)
                {
                    continue;
                }
                let Some(action_type) = action.action_type() else {
                    log::debug!(
                        target: self.name,
                        "ignoring unknown action {:?} of {}/{}",
                        action.action,
                        action.namespace,
                        action.name
                    );
                    continue;
                };
                if !self.is_event_recent(event.client_timestamp, pod).await {
                    continue;
                }
                if self.run_action(action, action_type, pod).await {
                    executed += 1;
                }
            }
        }

        executed
    }

    /// Whether `timestamp` is strictly after the creation of the live pod.
    /// Any lookup failure counts as not recent.
    async fn is_event_recent(&self, timestamp: DateTime<Utc>, pod: &Pod) -> bool {
        let lookup = self.pods.get_pod(&pod.namespace, &pod.name);
        let live_pod = match tokio::time::timeout(POD_LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(live_pod)) => live_pod,
            Ok(Err(err)) => {
                log::warn!(
                    target: self.name,
                    "can't check pod {}/{} before acting: {err}",
                    pod.namespace,
                    pod.name
                );
                return false;
            }
            Err(_) => {
                log::warn!(
                    target: self.name,
                    "can't check pod {}/{} before acting: timed out",
                    pod.namespace,
                    pod.name
                );
                return false;
            }
        };

        live_pod
            .metadata
            .creation_timestamp
            .is_some_and(|created| timestamp > created)
    }

    async fn run_action(&self, action: &Action, action_type: ActionType, pod: &Pod) -> bool {
        match action_type {
            ActionType::DeletePod => {
                log::info!(
                    target: self.name,
                    "run action {} ({action_type}) on pod {}/{}",
                    action.name,
                    pod.namespace,
                    pod.name
                );

                let delete = self.pods.delete_pod(&pod.namespace, &pod.name);
                match tokio::time::timeout(DELETE_POD_TIMEOUT, delete).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        bpf_common::log_error(
                            self.name,
                            "error while executing delete-pod action",
                            err,
                        );
                        return false;
                    }
                    Err(_) => {
                        log::error!(
                            target: self.name,
                            "error while executing delete-pod action: timed out after {DELETE_POD_TIMEOUT:?}"
                        );
                        return false;
                    }
                }

                self.ingest_pod_deleted(pod).await;
                true
            }
        }
    }

    async fn ingest_pod_deleted(&self, pod: &Pod) {
        let event = Event::new(
            EVENT_TYPE_POD_DELETED,
            Utc::now(),
            vec![Target {
                pod: Some(pod.clone()),
                ..Default::default()
            }],
        );
        let call = self.events.ingest_event(IngestEventRequest { event });
        if let Err(err) = service::with_timeout(INGEST_TIMEOUT, call).await {
            bpf_common::log_error(self.name, "error while logging pod-deleted event", err);
        }
    }
}

/// Keep `actions` in sync with the server every `interval`.
pub async fn sync_actions<C>(
    name: ModuleName,
    actions: Arc<PolicyCache<Action>>,
    client: C,
    interval: Duration,
    shutdown: ShutdownSignal,
) where
    C: ConfigService,
{
    let client = &client;
    cache::sync_loop(
        name,
        actions,
        interval,
        move || async move {
            let call = client.get_actions(GetActionsRequest::default());
            service::with_timeout(GET_ACTIONS_TIMEOUT, call)
                .await
                .map(|response| response.actions)
        },
        shutdown,
    )
    .await
}
