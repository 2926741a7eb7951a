//! Pods of the cluster (or of one node) indexed by container id.
//!
//! Container ids reported by the runtime in pod statuses are 64 hex chars,
//! while the correlator only recovers a prefix from cgroup paths. The index
//! is keyed by the first [`INDEX_PREFIX_LEN`] chars and lookups re-check the
//! full prefix against the candidates.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use tokio::time::Instant;
use vigil_core::pdk::{ModuleName, ShutdownSignal};

use crate::{
    KubeClient, KubeError, WatchStream,
    types::{Pod, PodList, WatchEvent},
};

pub const INDEX_PREFIX_LEN: usize = 15;

/// Server-side timeout of a single watch request.
const WATCH_TIMEOUT_SECS: u64 = 290;
/// Pause before relisting after a failed list or watch, doubled on every
/// consecutive failure up to [`MAX_RETRY_DELAY`].
const RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(80);

/// Field selector restricting the index to the pods scheduled on `node_name`.
pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

/// List and watch access to pods, implemented by [`KubeClient`].
pub trait PodSource: Send + Sync {
    type Watch: PodWatch;

    fn list_pods(
        &self,
        field_selector: Option<&str>,
    ) -> impl Future<Output = Result<PodList, KubeError>> + Send;

    fn watch_pods(
        &self,
        field_selector: Option<&str>,
        resource_version: &str,
        timeout_secs: u64,
    ) -> impl Future<Output = Result<Self::Watch, KubeError>> + Send;
}

/// Events of an open watch, `None` once the server ends it.
pub trait PodWatch: Send {
    fn next(&mut self) -> impl Future<Output = Option<Result<WatchEvent, KubeError>>> + Send;
}

impl PodSource for KubeClient {
    type Watch = WatchStream;

    async fn list_pods(&self, field_selector: Option<&str>) -> Result<PodList, KubeError> {
        KubeClient::list_pods(self, field_selector).await
    }

    async fn watch_pods(
        &self,
        field_selector: Option<&str>,
        resource_version: &str,
        timeout_secs: u64,
    ) -> Result<WatchStream, KubeError> {
        KubeClient::watch_pods(self, field_selector, resource_version, timeout_secs).await
    }
}

impl PodWatch for WatchStream {
    async fn next(&mut self) -> Option<Result<WatchEvent, KubeError>> {
        WatchStream::next(self).await
    }
}

struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self { next: RETRY_DELAY }
    }

    fn reset(&mut self) {
        self.next = RETRY_DELAY;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_RETRY_DELAY);
        delay
    }
}

#[derive(Default)]
struct Store {
    /// pods by uid
    pods: HashMap<String, Arc<Pod>>,
    /// container id prefix -> pod uids
    by_container: HashMap<String, HashSet<String>>,
    /// (namespace, name) -> pod uid
    by_name: HashMap<(String, String), String>,
}

impl Store {
    fn insert(&mut self, name: ModuleName, pod: Pod) {
        let uid = pod.metadata.uid.clone();
        self.remove(&uid);

        for container_id in pod.container_ids() {
            match index_key(container_id) {
                Ok(key) => {
                    self.by_container
                        .entry(key)
                        .or_default()
                        .insert(uid.clone());
                }
                Err(err) => log::warn!(
                    target: name,
                    "not indexing container of pod {}/{}: {err}",
                    pod.metadata.namespace,
                    pod.metadata.name
                ),
            }
        }
        self.by_name.insert(
            (pod.metadata.namespace.clone(), pod.metadata.name.clone()),
            uid.clone(),
        );
        self.pods.insert(uid, Arc::new(pod));
    }

    fn remove(&mut self, uid: &str) {
        let Some(pod) = self.pods.remove(uid) else {
            return;
        };
        for container_id in pod.container_ids() {
            if let Ok(key) = index_key(container_id) {
                if let Some(uids) = self.by_container.get_mut(&key) {
                    uids.remove(uid);
                    if uids.is_empty() {
                        self.by_container.remove(&key);
                    }
                }
            }
        }
        let name_key = (pod.metadata.namespace.clone(), pod.metadata.name.clone());
        if self.by_name.get(&name_key).map(String::as_str) == Some(uid) {
            self.by_name.remove(&name_key);
        }
    }
}

/// Strip the `<runtime>://` prefix of a status container id.
fn bare_container_id(container_id: &str) -> Result<&str, KubeError> {
    let parts: Vec<&str> = container_id.split("//").collect();
    match parts.as_slice() {
        [_, id] => Ok(id),
        _ => Err(KubeError::InvalidContainerId(container_id.to_string())),
    }
}

fn index_key(container_id: &str) -> Result<String, KubeError> {
    let id = bare_container_id(container_id)?;
    Ok(id.chars().take(INDEX_PREFIX_LEN).collect())
}

/// Shared, cheaply cloneable pod index.
#[derive(Clone)]
pub struct PodIndex {
    name: ModuleName,
    store: Arc<RwLock<Store>>,
}

impl PodIndex {
    pub fn new(name: ModuleName) -> Self {
        Self {
            name,
            store: Default::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pod running the container whose id starts with `container_id`.
    pub fn find_pod(&self, container_id: &str) -> Option<Arc<Pod>> {
        if container_id.is_empty() {
            return None;
        }
        let key: String = container_id.chars().take(INDEX_PREFIX_LEN).collect();
        let store = self.read();
        store
            .by_container
            .get(&key)?
            .iter()
            .filter_map(|uid| store.pods.get(uid))
            .find(|pod| {
                pod.container_ids().any(|id| {
                    bare_container_id(id).is_ok_and(|id| id.starts_with(container_id))
                })
            })
            .cloned()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        let store = self.read();
        let uid = store
            .by_name
            .get(&(namespace.to_string(), name.to_string()))?;
        store.pods.get(uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the index content with a fresh list.
    pub fn replace_all(&self, pods: Vec<Pod>) {
        let mut store = Store::default();
        for pod in pods {
            store.insert(self.name, pod);
        }
        *self.write() = store;
    }

    pub fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                self.write().insert(self.name, pod)
            }
            WatchEvent::Deleted(pod) => self.write().remove(&pod.metadata.uid),
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
        }
    }

    /// Keep the index current until `shutdown` fires.
    ///
    /// Pods are relisted every `resync` and whenever the watch fails; in
    /// between, watch events are applied as they come. Relists after a failure
    /// wait for an increasing delay, reset once a watch delivers events again.
    pub async fn run<S: PodSource>(
        self,
        source: S,
        field_selector: Option<String>,
        resync: Duration,
        mut shutdown: ShutdownSignal,
    ) {
        let name = self.name;
        let mut backoff = Backoff::new();
        loop {
            let list = tokio::select! {
                _ = shutdown.recv() => break,
                list = source.list_pods(field_selector.as_deref()) => list,
            };
            match list {
                Ok(list) => {
                    log::debug!(target: name, "listed {} pods", list.items.len());
                    self.replace_all(list.items);
                    let resource_version = list.metadata.resource_version.unwrap_or_default();

                    let resync_at = Instant::now() + resync;
                    let watch = self.watch(&source, field_selector.as_deref(), resource_version);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep_until(resync_at) => {
                            log::trace!(target: name, "periodic relist");
                            backoff.reset();
                            continue;
                        }
                        received_events = watch => if received_events {
                            backoff.reset();
                        },
                    }
                }
                Err(err) => bpf_common::log_error(name, "listing pods failed", err),
            }

            let delay = backoff.next_delay();
            log::debug!(target: name, "relisting pods in {}s", delay.as_secs());
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::debug!(target: name, "pod index stopped");
    }

    /// Apply watch events until the watch can't be resumed.
    ///
    /// A watch closed by the server is reopened unless it closed within
    /// [`RETRY_DELAY`] of being opened. Returns whether any event was applied.
    async fn watch<S: PodSource>(
        &self,
        source: &S,
        field_selector: Option<&str>,
        mut resource_version: String,
    ) -> bool {
        let name = self.name;
        let mut received_events = false;
        loop {
            let opened_at = Instant::now();
            let mut stream = match source
                .watch_pods(field_selector, &resource_version, WATCH_TIMEOUT_SECS)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    bpf_common::log_error(name, "opening pod watch failed", err);
                    return received_events;
                }
            };

            while let Some(event) = stream.next().await {
                match event {
                    Ok(WatchEvent::Error(status)) => {
                        let err = if status.code == 410 {
                            KubeError::Gone(resource_version)
                        } else {
                            KubeError::Api {
                                status: status.code,
                                message: status.message,
                            }
                        };
                        bpf_common::log_error(name, "pod watch interrupted", err);
                        return received_events;
                    }
                    Ok(event) => {
                        if let Some(version) = event.resource_version() {
                            resource_version = version.to_string();
                        }
                        received_events = true;
                        self.apply(event);
                    }
                    Err(err) => {
                        bpf_common::log_error(name, "pod watch failed", err);
                        return received_events;
                    }
                }
            }
            if opened_at.elapsed() < RETRY_DELAY {
                log::warn!(target: name, "pod watch closed right after opening");
                return received_events;
            }
            log::trace!(target: name, "pod watch expired, resuming from {resource_version}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use vigil_core::model::Labels;

    use super::*;
    use crate::types::{ContainerStatus, ObjectMeta};

    const NGINX_ID: &str = "3f084b4c7b789c1a0f174da3fcd339e31125d3096b3ff46a0bef4fad71d09362";

    fn pod(uid: &str, name: &str, container_ids: &[&str]) -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta {
                uid: uid.to_string(),
                name: name.to_string(),
                namespace: "default".to_string(),
                labels: Labels::from([("app".to_string(), name.to_string())]),
                ..Default::default()
            },
            ..Default::default()
        };
        pod.status.container_statuses = container_ids
            .iter()
            .map(|id| ContainerStatus {
                name: "main".to_string(),
                container_id: Some(id.to_string()),
            })
            .collect();
        pod
    }

    #[test]
    fn find_by_correlator_prefix() {
        let index = PodIndex::new("test");
        index.replace_all(vec![pod("1", "nginx", &[&format!("containerd://{NGINX_ID}")])]);

        let found = index.find_pod(&NGINX_ID[..31]).unwrap();
        assert_eq!(found.metadata.name, "nginx");
        assert!(index.find_pod(NGINX_ID).is_some());
    }

    #[test]
    fn same_index_key_different_container() {
        let index = PodIndex::new("test");
        index.replace_all(vec![
            pod("1", "nginx", &[&format!("containerd://{NGINX_ID}")]),
            pod("2", "redis", &["containerd://3f084b4c7b789c1ffffffffffffffffffffff"]),
        ]);

        let found = index.find_pod(&NGINX_ID[..31]).unwrap();
        assert_eq!(found.metadata.name, "nginx");
        assert!(index.find_pod("3f084b4c7b789c1aXXXXXXXXXXXXXXX").is_none());
    }

    #[test]
    fn empty_and_unknown_ids() {
        let index = PodIndex::new("test");
        index.replace_all(vec![pod("1", "nginx", &[&format!("containerd://{NGINX_ID}")])]);
        assert!(index.find_pod("").is_none());
        assert!(index.find_pod("0000000000000000000000000000000").is_none());
    }

    #[test]
    fn malformed_container_ids_are_skipped() {
        let index = PodIndex::new("test");
        index.replace_all(vec![pod(
            "1",
            "nginx",
            &[NGINX_ID, &format!("containerd://{NGINX_ID}")],
        )]);
        assert!(index.find_pod(&NGINX_ID[..31]).is_some());
        assert!(bare_container_id(NGINX_ID).is_err());
        assert!(bare_container_id("a//b//c").is_err());
    }

    #[test]
    fn watch_events_update_the_index() {
        let index = PodIndex::new("test");
        index.apply(WatchEvent::Added(pod("1", "nginx", &[])));
        assert!(index.find_pod(&NGINX_ID[..31]).is_none());
        assert!(index.get("default", "nginx").is_some());

        // container started
        index.apply(WatchEvent::Modified(pod(
            "1",
            "nginx",
            &[&format!("containerd://{NGINX_ID}")],
        )));
        assert!(index.find_pod(&NGINX_ID[..31]).is_some());
        assert_eq!(index.len(), 1);

        index.apply(WatchEvent::Deleted(pod("1", "nginx", &[])));
        assert!(index.find_pod(&NGINX_ID[..31]).is_none());
        assert!(index.get("default", "nginx").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn relist_drops_vanished_pods() {
        let index = PodIndex::new("test");
        index.replace_all(vec![pod("1", "nginx", &[]), pod("2", "redis", &[])]);
        index.replace_all(vec![pod("2", "redis", &[])]);
        assert!(index.get("default", "nginx").is_none());
        assert!(index.get("default", "redis").is_some());
    }

    /// Source answering every list with `pods` and every watch with `watch`.
    struct ScriptedSource {
        pods: Vec<Pod>,
        watch: fn() -> Result<Vec<WatchEvent>, KubeError>,
        lists: AtomicUsize,
        selectors: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pods: Vec<Pod>, watch: fn() -> Result<Vec<WatchEvent>, KubeError>) -> Arc<Self> {
            Arc::new(Self {
                pods,
                watch,
                lists: AtomicUsize::new(0),
                selectors: Mutex::new(Vec::new()),
            })
        }

        fn lists(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
        }
    }

    struct ScriptedWatch(std::vec::IntoIter<WatchEvent>);

    impl PodWatch for ScriptedWatch {
        async fn next(&mut self) -> Option<Result<WatchEvent, KubeError>> {
            self.0.next().map(Ok)
        }
    }

    impl PodSource for Arc<ScriptedSource> {
        type Watch = ScriptedWatch;

        async fn list_pods(&self, field_selector: Option<&str>) -> Result<PodList, KubeError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.selectors
                .lock()
                .unwrap()
                .push(field_selector.map(str::to_string));
            Ok(PodList {
                items: self.pods.clone(),
                ..Default::default()
            })
        }

        async fn watch_pods(
            &self,
            field_selector: Option<&str>,
            _resource_version: &str,
            _timeout_secs: u64,
        ) -> Result<ScriptedWatch, KubeError> {
            self.selectors
                .lock()
                .unwrap()
                .push(field_selector.map(str::to_string));
            (self.watch)().map(|events| ScriptedWatch(events.into_iter()))
        }
    }

    fn forbidden() -> Result<Vec<WatchEvent>, KubeError> {
        Err(KubeError::Api {
            status: 403,
            message: "pods is forbidden".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn failing_watch_backs_off_before_relisting() {
        let source = ScriptedSource::new(vec![pod("1", "nginx", &[])], forbidden);
        let index = PodIndex::new("test");
        let (tx, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(index.clone().run(
            Arc::clone(&source),
            None,
            Duration::from_secs(60),
            shutdown,
        ));

        // relists at 0s, 5s, 15s, 35s
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(source.lists(), 1);
        assert!(index.get("default", "nginx").is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.lists(), 2);
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(source.lists(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.lists(), 3);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(source.lists(), 4);

        tx.send_signal();
        task.await.unwrap();
    }

    #[test]
    fn retry_delay_is_capped() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 80, 80]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn node_selector_scopes_list_and_watch() {
        fn ended() -> Result<Vec<WatchEvent>, KubeError> {
            Ok(vec![WatchEvent::Added(pod("2", "redis", &[]))])
        }
        let source = ScriptedSource::new(vec![pod("1", "nginx", &[])], ended);
        let index = PodIndex::new("test");
        let (tx, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(index.clone().run(
            Arc::clone(&source),
            Some(node_field_selector("worker-1")),
            Duration::from_secs(60),
            shutdown,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(index.get("default", "redis").is_some());

        tx.send_signal();
        task.await.unwrap();

        let selectors = source.selectors.lock().unwrap().clone();
        assert!(selectors.len() >= 2);
        assert!(
            selectors
                .iter()
                .all(|selector| selector.as_deref() == Some("spec.nodeName=worker-1"))
        );
    }

    #[test]
    fn recreated_pod_keeps_name_entry() {
        let index = PodIndex::new("test");
        index.apply(WatchEvent::Added(pod("old", "nginx", &[])));
        index.apply(WatchEvent::Added(pod("new", "nginx", &[])));
        index.apply(WatchEvent::Deleted(pod("old", "nginx", &[])));
        assert_eq!(index.get("default", "nginx").unwrap().metadata.uid, "new");
    }
}
