//! The subset of the core/v1 pod schema the agents read.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use vigil_core::model::{self, Labels};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContainerStatus {
    pub name: String,
    /// `<runtime>://<id>`, missing until the container is created.
    #[serde(rename = "containerID")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    pub container_statuses: Vec<ContainerStatus>,
    pub init_container_statuses: Vec<ContainerStatus>,
    pub ephemeral_container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Pod {
    /// Runtime-qualified ids of every init, regular and ephemeral container.
    pub fn container_ids(&self) -> impl Iterator<Item = &str> {
        self.status
            .init_container_statuses
            .iter()
            .chain(&self.status.container_statuses)
            .chain(&self.status.ephemeral_container_statuses)
            .filter_map(|status| status.container_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Identity carried by events.
    pub fn to_model(&self) -> model::Pod {
        model::Pod::new(
            &self.metadata.uid,
            &self.metadata.name,
            &self.metadata.namespace,
            &self.metadata.labels,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMeta {
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodList {
    pub metadata: ListMeta,
    pub items: Vec<Pod>,
}

/// `Status` object returned with errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Status {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

/// One line of a watch response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    /// Only `metadata.resourceVersion` is set.
    Bookmark(Pod),
    Error(Status),
}

impl WatchEvent {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(pod)
            | WatchEvent::Modified(pod)
            | WatchEvent::Deleted(pod)
            | WatchEvent::Bookmark(pod) => pod.metadata.resource_version.as_deref(),
            WatchEvent::Error(_) => None,
        }
    }
}
