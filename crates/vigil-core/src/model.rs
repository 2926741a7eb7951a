//! Policy and event types shared between node agents, the cluster relay and the server.
//!
//! The JSON representation uses camelCase field names.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const KIND_CONSTRAINT: &str = "Constraint";
pub const KIND_ACTION: &str = "Action";
pub const KIND_EVENT: &str = "Event";

pub const EVENT_TYPE_VIOLATION: &str = "violation";
pub const EVENT_TYPE_FALCO_ALERT: &str = "falco_alert";
pub const EVENT_TYPE_POD_DELETED: &str = "pod_deleted";

/// Pod labels keyed by label name.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchLabel {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub match_labels: Vec<MatchLabel>,
}

impl Selector {
    pub fn from_labels(labels: &Labels) -> Self {
        Self {
            match_labels: labels
                .iter()
                .map(|(key, value)| MatchLabel {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedProcessRule {
    #[serde(default)]
    pub regex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedFileRule {
    pub name: String,
    #[serde(default)]
    pub sha256sum: Option<String>,
}

/// Allowlist of processes and files scoped to a namespace and a label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Constraint {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub selector: Option<Selector>,
    pub allowed_processes: Vec<AllowedProcessRule>,
    pub allowed_files: Vec<AllowedFileRule>,
}

impl Constraint {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: KIND_CONSTRAINT.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Falco alert priorities. Lower values are more severe.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FalcoPriority {
    #[default]
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    #[strum(to_string = "informational", serialize = "info")]
    Informational = 6,
    Debug = 7,
}

/// Remediation an [`Action`] can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum ActionType {
    #[strum(serialize = "delete-pod")]
    DeletePod,
}

/// Enforcement rule mapping violation triggers to a remediation for matching pods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Action {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub selector: Option<Selector>,
    pub on_violated_process: bool,
    pub on_violated_file: bool,
    pub on_falco_alert: bool,
    pub falco_priority: FalcoPriority,
    pub action: String,
}

impl Action {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: KIND_ACTION.to_string(),
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// The recognized remediation, `None` for unknown values.
    pub fn action_type(&self) -> Option<ActionType> {
        self.action.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

/// Point-in-time copy of a pod identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: Vec<Label>,
}

impl Pod {
    pub fn new(uid: &str, name: &str, namespace: &str, labels: &Labels) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: labels
                .iter()
                .map(|(key, value)| Label {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    pub fn label_map(&self) -> Labels {
        self.labels
            .iter()
            .map(|label| (label.key.clone(), label.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: i32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViolatedFile {
    pub name: String,
    pub actual_sha256sum: String,
    pub expected_sha256sum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FalcoAlert {
    pub rule: String,
    pub priority: FalcoPriority,
    pub output: String,
    pub output_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Target {
    pub pod: Option<Pod>,
    pub violated_processes: Vec<Process>,
    pub violated_files: Vec<ViolatedFile>,
    pub falco_alert: Option<FalcoAlert>,
}

/// Write-once record ingested by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub kind: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Assigned by the server.
    #[serde(default)]
    pub uid: String,
    pub client_timestamp: DateTime<Utc>,
    /// Assigned by the server.
    #[serde(default)]
    pub server_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Event {
    pub fn new(event_type: &str, client_timestamp: DateTime<Utc>, targets: Vec<Target>) -> Self {
        Self {
            kind: KIND_EVENT.to_string(),
            event_type: event_type.to_string(),
            uid: String::new(),
            client_timestamp,
            server_timestamp: None,
            targets,
        }
    }
}
