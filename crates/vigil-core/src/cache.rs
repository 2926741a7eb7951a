//! Local snapshots of server-side policy.
//!
//! A [`PolicyCache`] holds an immutable list behind an `Arc`. Refreshing the cache
//! swaps the `Arc` under the write lock, so a reader always sees one complete
//! list: either the one before the refresh or the one after it.
//!
//! [`sync_loop`] keeps a cache current by pulling the full list on a fixed
//! interval. A failed pull leaves the previous snapshot in place.

use std::{
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::MissedTickBehavior;

use crate::pdk::{ModuleName, ShutdownSignal};

#[derive(Debug)]
pub struct PolicyCache<T> {
    snapshot: RwLock<Arc<Vec<T>>>,
    initialized: AtomicBool,
}

impl<T> Default for PolicyCache<T> {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            initialized: AtomicBool::new(false),
        }
    }
}

impl<T> PolicyCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current list. Two calls may return different lists.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the whole list and mark the cache as initialized.
    pub fn replace(&self, items: Vec<T>) {
        let items = Arc::new(items);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = items,
            Err(poisoned) => *poisoned.into_inner() = items,
        }
        self.initialized.store(true, Ordering::Release);
    }

    /// True once a first successful sync has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// Refresh `cache` with `fetch` every `interval` until `shutdown` fires.
///
/// The first pull happens immediately.
pub async fn sync_loop<T, F, Fut, E>(
    name: ModuleName,
    cache: Arc<PolicyCache<T>>,
    interval: Duration,
    mut fetch: F,
    mut shutdown: ShutdownSignal,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                match fetch().await {
                    Ok(items) => {
                        log::trace!(target: name, "synced {} items", items.len());
                        cache.replace(items);
                    }
                    Err(err) => bpf_common::log_error(name, "error while syncing policies", err),
                }
            }
        }
    }

    log::debug!(target: name, "sync loop stopped");
}
