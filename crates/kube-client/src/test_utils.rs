//! In-memory [`PodApi`] for tests of the enforcement engine.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{KubeError, PodApi, types::Pod};

#[derive(Debug, Default)]
pub struct FakePodApi {
    pods: Mutex<HashMap<(String, String), Pod>>,
    deleted: Mutex<Vec<(String, String)>>,
    fail_delete: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FakePodApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.insert(pod);
        self
    }

    pub fn insert(&self, pod: Pod) {
        let key = (pod.metadata.namespace.clone(), pod.metadata.name.clone());
        lock(&self.pods).insert(key, pod);
    }

    /// Make deletions fail with a server error.
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// `(namespace, name)` of every deleted pod, in order.
    pub fn deleted(&self) -> Vec<(String, String)> {
        lock(&self.deleted).clone()
    }
}

impl PodApi for FakePodApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, KubeError> {
        lock(&self.pods)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| KubeError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(KubeError::Api {
                status: 500,
                message: "etcd unavailable".to_string(),
            });
        }
        let key = (namespace.to_string(), name.to_string());
        if lock(&self.pods).remove(&key).is_none() {
            return Err(KubeError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        lock(&self.deleted).push(key);
        Ok(())
    }
}
