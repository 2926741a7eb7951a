//! Minimal Kubernetes API client used by the vigil agents.
//!
//! Only the pod resource is needed: agents list and watch pods to keep a
//! [`PodIndex`] keyed by container id, the enforcement engine reads and
//! deletes single pods through the [`PodApi`] trait.

mod client;
mod config;
mod error;
pub mod pod_index;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

use std::{future::Future, sync::Arc};

pub use client::{KubeClient, WatchStream};
pub use config::KubeConfig;
pub use error::KubeError;
pub use pod_index::PodIndex;
pub use types::Pod;

/// Single-pod operations needed by the enforcement engine.
pub trait PodApi: Send + Sync {
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Pod, KubeError>> + Send;

    fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), KubeError>> + Send;
}

impl<T: PodApi> PodApi for Arc<T> {
    fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Pod, KubeError>> + Send {
        (**self).get_pod(namespace, name)
    }

    fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), KubeError>> + Send {
        (**self).delete_pod(namespace, name)
    }
}
