//! Running log streams keyed by workload.
//!
//! Each registered workload owns one stream handle. Tailers spawned for the
//! workload hold clones of its [`CancelSignal`]; firing the handle asks them
//! to close their log streams, and the handle can tell when the last clone
//! has been dropped. Handles are taken out of the map before they are fired,
//! so the lock is never held while waiting on tailers.

use std::collections::HashMap;

use futures_util::future::join_all;
use kubelog_core::WorkloadKey;
use tokio::sync::{Mutex, mpsc, watch};
use uuid::Uuid;

/// Cancellation signal observed by the tailers of one workload.
///
/// Cloning is cheap. The registry waits for every clone to be dropped when
/// the workload is stopped.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    fired: watch::Receiver<bool>,
    _alive: mpsc::Sender<()>,
}

impl CancelSignal {
    /// Resolves once the workload is stopped or replaced, or the registry
    /// that issued the signal is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.fired.wait_for(|fired| *fired).await;
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.fired.borrow()
    }
}

struct StreamHandle {
    id: Uuid,
    fire: watch::Sender<bool>,
    done: mpsc::Receiver<()>,
}

impl StreamHandle {
    fn new() -> (Self, CancelSignal) {
        let (fire, fired) = watch::channel(false);
        let (alive, done) = mpsc::channel(1);
        let handle = Self {
            id: Uuid::new_v4(),
            fire,
            done,
        };
        (handle, CancelSignal { fired, _alive: alive })
    }

    fn fire(&self) {
        self.fire.send_replace(true);
    }

    /// Wait until every signal clone has been dropped.
    async fn finished(mut self) {
        while self.done.recv().await.is_some() {}
    }
}

/// Registry of running log streams.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<WorkloadKey, StreamHandle>>,
}

impl StreamRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh stream for `key` and return its signal.
    ///
    /// A stream already registered under `key` is replaced and its signal
    /// fired, so its tailers shut down instead of running unowned.
    pub async fn register(&self, key: WorkloadKey) -> CancelSignal {
        let (handle, signal) = StreamHandle::new();
        let id = handle.id;
        let replaced = self.streams.lock().await.insert(key.clone(), handle);

        if let Some(old) = replaced {
            old.fire();
            tracing::info!(workload = %key, stream = %id, replaced = %old.id, "Replaced running log stream");
        } else {
            tracing::debug!(workload = %key, stream = %id, "Registered log stream");
        }

        signal
    }

    /// Stop the stream registered under `key`.
    ///
    /// Returns once every tailer of that stream has exited, or `false`
    /// straight away if nothing is registered under `key`.
    pub async fn stop(&self, key: &WorkloadKey) -> bool {
        let Some(handle) = self.streams.lock().await.remove(key) else {
            tracing::debug!(workload = %key, "No running log stream to stop");
            return false;
        };

        let id = handle.id;
        handle.fire();
        handle.finished().await;
        tracing::info!(workload = %key, stream = %id, "Stopped log stream");
        true
    }

    /// Stop every registered stream and return how many there were.
    pub async fn stop_all(&self) -> usize {
        let handles: Vec<(WorkloadKey, StreamHandle)> =
            self.streams.lock().await.drain().collect();

        for (_, handle) in &handles {
            handle.fire();
        }

        let count = handles.len();
        join_all(handles.into_iter().map(|(_, handle)| handle.finished())).await;

        tracing::info!(count, "Stopped all log streams");
        count
    }

    /// Whether a stream is registered under `key`.
    pub async fn is_active(&self, key: &WorkloadKey) -> bool {
        self.streams.lock().await.contains_key(key)
    }

    /// Keys of all registered streams, sorted.
    pub async fn active_keys(&self) -> Vec<WorkloadKey> {
        let mut keys: Vec<WorkloadKey> = self.streams.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    fn key(name: &str) -> WorkloadKey {
        WorkloadKey::new("ns", name)
    }

    fn observe(mut signal: CancelSignal) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { signal.cancelled().await })
    }

    #[tokio::test]
    async fn test_stop_unblocks_observer() {
        let registry = StreamRegistry::new();
        let observer = observe(registry.register(key("app")).await);

        assert!(timeout(WAIT, registry.stop(&key("app"))).await.unwrap());
        timeout(WAIT, observer).await.unwrap().unwrap();
        assert!(!registry.is_active(&key("app")).await);
    }

    #[tokio::test]
    async fn test_stop_leaves_other_keys_running() {
        let registry = StreamRegistry::new();
        let a = registry.register(key("a")).await;
        let b = registry.register(key("b")).await;
        let observer = observe(a);

        assert!(timeout(WAIT, registry.stop(&key("a"))).await.unwrap());
        timeout(WAIT, observer).await.unwrap().unwrap();

        assert!(!b.is_cancelled());
        assert_eq!(registry.active_keys().await, vec![key("b")]);
    }

    #[tokio::test]
    async fn test_stop_unknown_key_returns_immediately() {
        let registry = StreamRegistry::new();
        assert!(!timeout(WAIT, registry.stop(&key("missing"))).await.unwrap());

        let signal = registry.register(key("app")).await;
        drop(signal);
        assert!(registry.stop(&key("app")).await);
        assert!(!timeout(WAIT, registry.stop(&key("app"))).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_all_fires_every_stream() {
        let registry = StreamRegistry::new();
        let mut observers = Vec::new();
        for name in ["a", "b", "c"] {
            let signal = registry.register(key(name)).await;
            observers.push(observe(signal.clone()));
            observers.push(observe(signal));
        }

        assert_eq!(timeout(WAIT, registry.stop_all()).await.unwrap(), 3);
        for observer in observers {
            timeout(WAIT, observer).await.unwrap().unwrap();
        }
        assert!(registry.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_and_fires_previous() {
        let registry = StreamRegistry::new();
        let first = registry.register(key("app")).await;
        let second = registry.register(key("app")).await;

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.active_keys().await.len(), 1);

        let observer = observe(second);
        assert!(timeout(WAIT, registry.stop(&key("app"))).await.unwrap());
        timeout(WAIT, observer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_observers_to_exit() {
        let registry = StreamRegistry::new();
        let mut signal = registry.register(key("app")).await;
        let exited = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&exited);
        tokio::spawn(async move {
            signal.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            drop(signal);
        });

        assert!(timeout(WAIT, registry.stop(&key("app"))).await.unwrap());
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_registry_releases_observers() {
        let registry = StreamRegistry::new();
        let observer = observe(registry.register(key("app")).await);
        drop(registry);
        timeout(WAIT, observer).await.unwrap().unwrap();
    }
}
