//! Receiver of the Falco alerts forwarded by falcosidekick.
//!
//! Alerts raised by the spawned process rule go through the same allowlist as
//! the exec monitor: the process name is validated against the constraints of
//! its pod. Any other rule is reported as-is, with the Falco priority, so that
//! actions reacting to Falco alerts can fire. Reported events are handed to
//! the local enforcement engine once the server has accepted them.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    routing::any,
};
use chrono::{DateTime, Utc};
use engine_api::server::{self, ServerHandle};
use kube_client::{Pod, PodIndex};
use process_validator::{
    CompiledConstraint, EventReporter, REGISTER_ANNOTATION, THREAT_SCAN_ANNOTATION,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use vigil_core::{
    PolicyCache, matching,
    model::{
        AllowedProcessRule, Constraint, EVENT_TYPE_FALCO_ALERT, Event, FalcoAlert, FalcoPriority,
        Process, Selector, Target,
    },
    pdk::{ConfigError, ModuleConfig, ModuleName},
    service::{ConfigService, EventService},
};

pub const MODULE_NAME: ModuleName = "falco-listener";

/// Falco rule reporting processes spawned in annotated pods.
pub const SPAWNED_PROCESS_RULE: &str = "vigil.dev/v1 detect spawned_process";

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest Kubernetes object name.
const MAX_NAME_LEN: usize = 253;
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

const FIELD_NAMESPACE: &str = "k8s.ns.name";
const FIELD_POD_NAME: &str = "k8s.pod.name";
const FIELD_PROC_NAME: &str = "proc.name";
const FIELD_PROC_PID: &str = "proc.pid";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_address: SocketAddr,
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            listen_address: config
                .with_default("falco_listen_address", SocketAddr::from(([0, 0, 0, 0], 8089)))?,
        })
    }
}

/// Alert as posted by falcosidekick.
#[derive(Debug, Clone, Deserialize)]
pub struct FalcoPayload {
    pub rule: String,
    pub priority: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, alias = "outputFields")]
    pub output_fields: BTreeMap<String, Value>,
}

impl FalcoPayload {
    /// Output field rendered as text. Non string values keep their JSON form.
    pub fn field(&self, key: &str) -> Option<String> {
        self.output_fields.get(key).and_then(|value| match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
    }

    /// Unknown priorities are the least severe.
    pub fn priority(&self) -> FalcoPriority {
        self.priority.parse().unwrap_or(FalcoPriority::Debug)
    }

    fn fields(&self) -> BTreeMap<String, String> {
        self.output_fields
            .keys()
            .filter_map(|key| Some((key.clone(), self.field(key)?)))
            .collect()
    }

    fn client_timestamp(&self) -> DateTime<Utc> {
        self.time.unwrap_or_else(Utc::now)
    }
}

/// What happened to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Allowed,
    Registered,
    Reported,
    /// The server didn't take the event.
    Dropped,
}

pub struct FalcoListener<C> {
    name: ModuleName,
    pods: PodIndex,
    constraints: Arc<PolicyCache<CompiledConstraint>>,
    reporter: EventReporter<C>,
    event_queue: mpsc::Sender<Event>,
}

impl<C> FalcoListener<C>
where
    C: ConfigService + EventService,
{
    pub fn new(
        name: ModuleName,
        pods: PodIndex,
        constraints: Arc<PolicyCache<CompiledConstraint>>,
        client: C,
        event_queue: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            name,
            pods,
            constraints,
            reporter: EventReporter::new(name, client, REPORT_TIMEOUT),
            event_queue,
        }
    }

    pub async fn handle(&self, payload: FalcoPayload) -> Outcome {
        log::debug!(target: self.name, "falco alert: {} ({})", payload.rule, payload.priority);
        if payload.rule == SPAWNED_PROCESS_RULE {
            self.handle_spawned_process(payload).await
        } else {
            self.handle_alert(payload).await
        }
    }

    fn lookup_pod(&self, payload: &FalcoPayload) -> Option<Arc<Pod>> {
        let namespace = payload.field(FIELD_NAMESPACE).unwrap_or_default();
        let pod_name = payload.field(FIELD_POD_NAME).unwrap_or_default();
        let pod = self.pods.get(&namespace, &pod_name);
        if pod.is_none() {
            log::warn!(
                target: self.name,
                "pod {}/{} of falco alert not found",
                sanitize(&namespace),
                sanitize(&pod_name)
            );
        }
        pod
    }

    async fn handle_spawned_process(&self, payload: FalcoPayload) -> Outcome {
        if !self.constraints.is_initialized() {
            log::info!(target: self.name, "constraints not synced yet, ignoring falco alert");
            return Outcome::Ignored;
        }
        let Some(pod) = self.lookup_pod(&payload) else {
            return Outcome::Ignored;
        };

        let threat_scan = pod.annotation(THREAT_SCAN_ANNOTATION).is_some();
        let register = pod.annotation(REGISTER_ANNOTATION);
        if !threat_scan && register.is_none() {
            return Outcome::Ignored;
        }

        let process_name = payload.field(FIELD_PROC_NAME).unwrap_or_default();
        let constraints = self.constraints.snapshot();
        let matched: Vec<&CompiledConstraint> = constraints
            .iter()
            .filter(|constraint| constraint.selector.as_ref().is_some_and(|s| !s.is_empty()))
            .filter(|constraint| {
                matching::constraint_matches_pod(
                    constraint,
                    &pod.metadata.namespace,
                    &pod.metadata.labels,
                )
            })
            .collect();

        if !matched.is_empty()
            && process_validator::is_allowed_process(
                self.name,
                matched.iter().copied(),
                &process_name,
            )
        {
            return Outcome::Allowed;
        }

        if register.is_some_and(process_validator::registers_processes) {
            log::info!(
                target: self.name,
                "spawned process {process_name} in {}/{}, registering",
                pod.metadata.namespace,
                pod.metadata.name
            );
            self.reporter
                .register_constraint(constraint_from_spawned_process(&pod, &process_name))
                .await;
            return Outcome::Registered;
        }

        if matched.is_empty() {
            return Outcome::Ignored;
        }

        let pid = match payload.field(FIELD_PROC_PID) {
            Some(pid) => pid.parse().unwrap_or_else(|err| {
                log::warn!(target: self.name, "invalid pid {pid:?} in falco alert: {err}");
                0
            }),
            None => 0,
        };
        let target = Target {
            pod: Some(pod.to_model()),
            violated_processes: vec![Process {
                pid,
                name: process_name,
            }],
            ..Default::default()
        };
        self.report(Event::new(
            EVENT_TYPE_FALCO_ALERT,
            payload.client_timestamp(),
            vec![target],
        ))
        .await
    }

    async fn handle_alert(&self, payload: FalcoPayload) -> Outcome {
        let Some(pod) = self.lookup_pod(&payload) else {
            return Outcome::Ignored;
        };

        let target = Target {
            pod: Some(pod.to_model()),
            falco_alert: Some(FalcoAlert {
                rule: payload.rule.clone(),
                priority: payload.priority(),
                output: payload.output.clone(),
                output_fields: payload.fields(),
            }),
            ..Default::default()
        };
        self.report(Event::new(
            EVENT_TYPE_FALCO_ALERT,
            payload.client_timestamp(),
            vec![target],
        ))
        .await
    }

    async fn report(&self, event: Event) -> Outcome {
        if !self.reporter.report(event.clone()).await {
            return Outcome::Dropped;
        }
        if self.event_queue.send(event).await.is_err() {
            log::warn!(target: self.name, "action handler stopped, event not queued");
        }
        Outcome::Reported
    }
}

/// Constraint allowing `process_name` for pods labelled like `pod`.
fn constraint_from_spawned_process(pod: &Pod, process_name: &str) -> Constraint {
    let mut labels = pod.metadata.labels.clone();
    labels.remove(POD_TEMPLATE_HASH_LABEL);

    let hours = Utc::now().timestamp_nanos_opt().unwrap_or_default() / 3_600_000;
    let mut constraint = Constraint::new(
        pod.metadata.namespace.clone(),
        format!("{}-{hours}", pod.metadata.name),
    );
    constraint.selector = Some(Selector::from_labels(&labels));
    constraint.allowed_processes = vec![AllowedProcessRule {
        regex: Some(format!("^{}$", regex::escape(process_name))),
    }];
    constraint
}

/// Make a name taken from an alert safe to log.
fn sanitize(name: &str) -> String {
    name.chars()
        .take(MAX_NAME_LEN)
        .filter(|c| *c != '\n' && *c != '\r')
        .collect()
}

/// Serve the falcosidekick webhook on `address`.
pub async fn run_falco_listener<C>(
    address: SocketAddr,
    listener: FalcoListener<C>,
) -> Result<ServerHandle>
where
    C: ConfigService + EventService + 'static,
{
    let name = listener.name;
    let app = Router::new()
        .route("/", any(receive_alert::<C>))
        .with_state(Arc::new(listener));
    server::serve(name, address, app).await
}

async fn receive_alert<C>(
    State(listener): State<Arc<FalcoListener<C>>>,
    method: Method,
    body: Bytes,
) -> (StatusCode, &'static str)
where
    C: ConfigService + EventService + 'static,
{
    if method != Method::POST {
        return (StatusCode::BAD_REQUEST, "Only POST http method is supported");
    }

    let payload = match serde_json::from_slice::<FalcoPayload>(&body) {
        Ok(payload) => payload,
        Err(err) => {
            log::warn!(target: listener.name, "invalid falco payload: {err}");
            return (
                StatusCode::BAD_REQUEST,
                "Error encountered while decoding falco payload",
            );
        }
    };

    listener.handle(payload).await;
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use kube_client::types::ObjectMeta;
    use vigil_core::{
        model::Labels,
        test_utils::MemoryServer,
    };

    use super::*;

    struct Fixture {
        server: Arc<MemoryServer>,
        constraints: Arc<PolicyCache<CompiledConstraint>>,
        listener: Arc<FalcoListener<Arc<MemoryServer>>>,
        queue: mpsc::Receiver<Event>,
    }

    fn pod(name: &str, annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: format!("uid-{name}"),
                name: name.to_string(),
                namespace: "default".to_string(),
                labels: Labels::from([
                    ("app".to_string(), "nginx".to_string()),
                    (POD_TEMPLATE_HASH_LABEL.to_string(), "5d4f".to_string()),
                ]),
                annotations: annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn nginx_constraint(regex: &str) -> Constraint {
        let mut constraint = Constraint::new("default", "nginx");
        constraint.selector = Some(Selector::from_labels(&Labels::from([(
            "app".to_string(),
            "nginx".to_string(),
        )])));
        constraint.allowed_processes = vec![AllowedProcessRule {
            regex: Some(regex.to_string()),
        }];
        constraint
    }

    fn fixture(pods: Vec<Pod>, constraints: Option<Vec<Constraint>>) -> Fixture {
        let server = Arc::new(MemoryServer::new());
        let index = PodIndex::new("test");
        index.replace_all(pods);
        let cache = Arc::new(PolicyCache::new());
        if let Some(constraints) = constraints {
            cache.replace(process_validator::compile_constraints("test", constraints));
        }
        let (tx, rx) = mpsc::channel(16);
        let listener = FalcoListener::new("test", index, cache.clone(), server.clone(), tx);
        Fixture {
            server,
            constraints: cache,
            listener: Arc::new(listener),
            queue: rx,
        }
    }

    fn payload(rule: &str, priority: &str, fields: Value) -> FalcoPayload {
        serde_json::from_value(serde_json::json!({
            "rule": rule,
            "priority": priority,
            "output": "10:00:00 Notice something happened",
            "time": "2024-01-01T10:00:00.123456789Z",
            "output_fields": fields,
        }))
        .unwrap()
    }

    fn spawned(proc_name: &str) -> FalcoPayload {
        payload(
            SPAWNED_PROCESS_RULE,
            "Notice",
            serde_json::json!({
                "k8s.ns.name": "default",
                "k8s.pod.name": "nginx-1",
                "proc.name": proc_name,
                "proc.pid": 4242,
            }),
        )
    }

    #[test]
    fn payload_fields_are_stringified() {
        let payload = payload(
            "Terminal shell in container",
            "WARNING",
            serde_json::json!({"proc.pid": 12, "user.name": "root", "evt.arg": null}),
        );
        assert_eq!(payload.priority(), FalcoPriority::Warning);
        assert_eq!(payload.field("proc.pid").as_deref(), Some("12"));
        assert_eq!(payload.field("evt.arg"), None);
        assert_eq!(
            payload.fields(),
            BTreeMap::from([
                ("proc.pid".to_string(), "12".to_string()),
                ("user.name".to_string(), "root".to_string()),
            ])
        );
        assert_eq!(
            payload.client_timestamp().timestamp_subsec_nanos(),
            123_456_789
        );
    }

    #[test]
    fn camel_case_output_fields() {
        let payload: FalcoPayload = serde_json::from_str(
            r#"{"rule": "r", "priority": "info", "outputFields": {"k8s.pod.name": "nginx-1"}}"#,
        )
        .unwrap();
        assert_eq!(payload.priority(), FalcoPriority::Informational);
        assert_eq!(payload.field("k8s.pod.name").as_deref(), Some("nginx-1"));
    }

    #[test]
    fn unknown_priority_is_least_severe() {
        let payload = payload("r", "Loud", serde_json::json!({}));
        assert_eq!(payload.priority(), FalcoPriority::Debug);
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize("nginx\n-1"), "nginx-1");
        assert_eq!(sanitize(&"a".repeat(300)).len(), MAX_NAME_LEN);
    }

    #[tokio::test]
    async fn generic_alert_is_reported_and_queued() {
        let mut f = fixture(vec![pod("nginx-1", &[])], None);
        let alert = payload(
            "Terminal shell in container",
            "Critical",
            serde_json::json!({"k8s.ns.name": "default", "k8s.pod.name": "nginx-1"}),
        );

        assert_eq!(f.listener.handle(alert).await, Outcome::Reported);

        let events = f.server.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_TYPE_FALCO_ALERT);
        let target = &events[0].targets[0];
        assert_eq!(target.pod.as_ref().unwrap().uid, "uid-nginx-1");
        let alert = target.falco_alert.as_ref().unwrap();
        assert_eq!(alert.priority, FalcoPriority::Critical);
        assert_eq!(alert.output_fields["k8s.pod.name"], "nginx-1");

        let queued = f.queue.try_recv().unwrap();
        assert_eq!(queued.targets, events[0].targets);
    }

    #[tokio::test]
    async fn failed_ingest_is_not_queued() {
        let mut f = fixture(vec![pod("nginx-1", &[])], None);
        f.server.set_unavailable(true);
        let alert = payload(
            "Terminal shell in container",
            "Critical",
            serde_json::json!({"k8s.ns.name": "default", "k8s.pod.name": "nginx-1"}),
        );

        assert_eq!(f.listener.handle(alert).await, Outcome::Dropped);
        assert!(f.queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn alert_for_unknown_pod_is_ignored() {
        let f = fixture(vec![], Some(vec![]));
        let alert = payload(
            "Terminal shell in container",
            "Critical",
            serde_json::json!({"k8s.ns.name": "default", "k8s.pod.name": "ghost\n"}),
        );
        assert_eq!(f.listener.handle(alert).await, Outcome::Ignored);
        assert!(f.server.events().is_empty());
    }

    #[tokio::test]
    async fn spawned_process_waits_for_constraints() {
        let f = fixture(vec![pod("nginx-1", &[(THREAT_SCAN_ANNOTATION, "")])], None);
        assert_eq!(f.listener.handle(spawned("sh")).await, Outcome::Ignored);
    }

    #[tokio::test]
    async fn spawned_process_needs_annotation() {
        let f = fixture(
            vec![pod("nginx-1", &[])],
            Some(vec![nginx_constraint("^nginx$")]),
        );
        assert_eq!(f.listener.handle(spawned("sh")).await, Outcome::Ignored);
        assert!(f.server.events().is_empty());
    }

    #[tokio::test]
    async fn allowed_spawned_process() {
        let f = fixture(
            vec![pod("nginx-1", &[(THREAT_SCAN_ANNOTATION, "")])],
            Some(vec![nginx_constraint("^nginx$")]),
        );
        assert_eq!(f.listener.handle(spawned("nginx")).await, Outcome::Allowed);
        assert!(f.server.events().is_empty());
    }

    #[tokio::test]
    async fn violating_spawned_process_is_reported() {
        let mut f = fixture(
            vec![pod("nginx-1", &[(THREAT_SCAN_ANNOTATION, "")])],
            Some(vec![nginx_constraint("^nginx$")]),
        );
        assert_eq!(f.listener.handle(spawned("sh")).await, Outcome::Reported);

        let events = f.server.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_TYPE_FALCO_ALERT);
        let process = &events[0].targets[0].violated_processes[0];
        assert_eq!((process.pid, process.name.as_str()), (4242, "sh"));
        assert!(f.queue.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unconstrained_pod_is_not_reported() {
        let mut other = nginx_constraint("^nginx$");
        other.selector = Some(Selector::from_labels(&Labels::from([(
            "app".to_string(),
            "redis".to_string(),
        )])));
        let f = fixture(
            vec![pod("nginx-1", &[(THREAT_SCAN_ANNOTATION, "")])],
            Some(vec![other]),
        );
        assert_eq!(f.listener.handle(spawned("sh")).await, Outcome::Ignored);
        assert!(f.server.events().is_empty());
    }

    #[tokio::test]
    async fn register_mode_adds_constraint() {
        let f = fixture(
            vec![pod("nginx-1", &[(REGISTER_ANNOTATION, "processes")])],
            Some(vec![]),
        );
        assert_eq!(f.listener.handle(spawned("nginx")).await, Outcome::Registered);

        let constraints = f.server.constraints();
        assert_eq!(constraints.len(), 1);
        let constraint = &constraints[0];
        assert!(constraint.name.starts_with("nginx-1-"));
        assert_eq!(
            constraint.allowed_processes[0].regex.as_deref(),
            Some("^nginx$")
        );
        let selector = constraint.selector.as_ref().unwrap();
        assert_eq!(selector.match_labels.len(), 1);
        assert_eq!(selector.match_labels[0].key, "app");
        assert!(f.server.events().is_empty());
        assert!(f.constraints.is_initialized());
    }

    #[tokio::test]
    async fn invalid_pid_is_zero() {
        let f = fixture(
            vec![pod("nginx-1", &[(THREAT_SCAN_ANNOTATION, "")])],
            Some(vec![nginx_constraint("^nginx$")]),
        );
        let mut alert = spawned("sh");
        alert
            .output_fields
            .insert(FIELD_PROC_PID.to_string(), Value::from("n/a"));
        assert_eq!(f.listener.handle(alert).await, Outcome::Reported);
        assert_eq!(f.server.events()[0].targets[0].violated_processes[0].pid, 0);
    }

    #[tokio::test]
    async fn webhook_rejects_bad_requests() {
        let f = fixture(vec![], None);

        let (status, body) =
            receive_alert(State(f.listener.clone()), Method::GET, Bytes::new()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Only POST http method is supported");

        let (status, body) =
            receive_alert(State(f.listener.clone()), Method::POST, Bytes::new()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Error encountered while decoding falco payload");

        let (status, _) = receive_alert(
            State(f.listener.clone()),
            Method::POST,
            Bytes::from_static(b"{\"rule\": 1}"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_accepts_alerts() {
        let f = fixture(vec![], None);
        let body = serde_json::to_vec(&serde_json::json!({
            "rule": "Terminal shell in container",
            "priority": "Warning",
            "output_fields": {},
        }))
        .unwrap();

        let (status, body) =
            receive_alert(State(f.listener.clone()), Method::POST, Bytes::from(body)).await;
        assert_eq!((status, body), (StatusCode::OK, "OK"));
    }
}
