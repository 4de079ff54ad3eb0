//! In-process coordination store.
//!
//! A single mutex makes every operation linearizable. A janitor task sweeps
//! expired leases so watchers observe expiry-driven deletions without any
//! reader touching the store; operations also expire lazily so reads never
//! return a key whose lease has already lapsed, even between sweeps.
//!
//! Must be created inside a Tokio runtime (the janitor is spawned on
//! construction).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::traits::{Coordinator, CoordinatorError, LeaseId, WatchEvent, WatchStream};

/// How often the janitor looks for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct KeyEntry {
    value: Vec<u8>,
    lease: LeaseId,
}

#[derive(Debug)]
struct LeaseEntry {
    expires_at: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct State {
    keys: BTreeMap<String, KeyEntry>,
    leases: HashMap<LeaseId, LeaseEntry>,
    watchers: Vec<Watcher>,
    next_lease: LeaseId,
}

impl State {
    fn notify(&mut self, event: &WatchEvent) {
        let key = match event {
            WatchEvent::Put { key, .. } => key,
            WatchEvent::Delete { key } => key,
        };
        self.watchers
            .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
    }

    fn remove_key(&mut self, key: &str) -> bool {
        match self.keys.remove(key) {
            Some(entry) => {
                if let Some(lease) = self.leases.get_mut(&entry.lease) {
                    lease.keys.remove(key);
                }
                self.notify(&WatchEvent::Delete {
                    key: key.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) {
        if let Some(lease) = self.leases.remove(&id) {
            for key in lease.keys {
                self.keys.remove(&key);
                self.notify(&WatchEvent::Delete { key });
            }
        }
    }
}

/// In-process [`Coordinator`] backed by a mutex-guarded map.
#[derive(Debug)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinator {
    /// Create a store and spawn its lease janitor.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        spawn_janitor(&state);
        Self { state }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().expect("coordinator lock poisoned");
        state.expire(Instant::now());
        state
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_janitor(state: &Arc<Mutex<State>>) {
    let weak: Weak<Mutex<State>> = Arc::downgrade(state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(state) = weak.upgrade() else { return };
            let mut state = state.lock().expect("coordinator lock poisoned");
            state.expire(Instant::now());
        }
    });
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId, CoordinatorError> {
        let mut state = self.locked();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseEntry {
                expires_at: Instant::now() + ttl,
                ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        let mut state = self.locked();
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(CoordinatorError::LeaseExpired)?;
        entry.expires_at = Instant::now() + entry.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), CoordinatorError> {
        let mut state = self.locked();
        state.drop_lease(lease);
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<bool, CoordinatorError> {
        let mut state = self.locked();
        if !state.leases.contains_key(&lease) {
            return Err(CoordinatorError::LeaseExpired);
        }
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.clone(),
                lease,
            },
        );
        if let Some(entry) = state.leases.get_mut(&lease) {
            entry.keys.insert(key.to_string());
        }
        state.notify(&WatchEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinatorError> {
        let mut state = self.locked();
        Ok(state.remove_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinatorError> {
        let state = self.locked();
        Ok(state.keys.get(key).map(|entry| entry.value.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CoordinatorError> {
        let state = self.locked();
        Ok(state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, CoordinatorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.locked();
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    const TTL: Duration = Duration::from_millis(200);

    async fn next_event(stream: &mut WatchStream) -> WatchEvent {
        timeout(Duration::from_secs(2), stream.recv())
            .await
            .expect("timed out waiting for watch event")
            .expect("watch closed")
    }

    #[tokio::test]
    async fn test_put_if_absent_is_create_only() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();

        assert!(store.put_if_absent("/a/k", b"1".to_vec(), lease).await.unwrap());
        assert!(!store.put_if_absent("/a/k", b"2".to_vec(), lease).await.unwrap());
        assert_eq!(store.get("/a/k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_put_with_dead_lease_fails() {
        let store = MemoryCoordinator::new();
        let result = store.put_if_absent("/a/k", b"1".to_vec(), 42).await;
        assert!(matches!(result, Err(CoordinatorError::LeaseExpired)));
    }

    #[tokio::test]
    async fn test_lease_expiry_removes_keys() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put_if_absent("/a/k", b"1".to_vec(), lease).await.unwrap();

        tokio::time::sleep(TTL * 3).await;

        assert_eq!(store.get("/a/k").await.unwrap(), None);
        assert!(matches!(
            store.keep_alive(lease).await,
            Err(CoordinatorError::LeaseExpired)
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_extends_lease() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put_if_absent("/a/k", b"1".to_vec(), lease).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(TTL / 2).await;
            store.keep_alive(lease).await.unwrap();
        }
        assert_eq!(store.get("/a/k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_revoke_removes_keys() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put_if_absent("/a/k1", b"1".to_vec(), lease).await.unwrap();
        store.put_if_absent("/a/k2", b"2".to_vec(), lease).await.unwrap();

        store.revoke(lease).await.unwrap();

        assert_eq!(store.get("/a/k1").await.unwrap(), None);
        assert_eq!(store.get("/a/k2").await.unwrap(), None);
        // Idempotent.
        store.revoke(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put_if_absent("/a/k1", b"1".to_vec(), lease).await.unwrap();
        store.put_if_absent("/a/k2", b"2".to_vec(), lease).await.unwrap();
        store.put_if_absent("/b/k3", b"3".to_vec(), lease).await.unwrap();

        let listed = store.list("/a/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "/a/k1");
        assert_eq!(listed[1].0, "/a/k2");
    }

    #[tokio::test]
    async fn test_watch_sees_put_and_delete() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();
        let mut watch = store.watch("/a/").await.unwrap();

        store.put_if_absent("/a/k", b"1".to_vec(), lease).await.unwrap();
        store.put_if_absent("/b/other", b"x".to_vec(), lease).await.unwrap();
        store.delete("/a/k").await.unwrap();

        assert_eq!(
            next_event(&mut watch).await,
            WatchEvent::Put {
                key: "/a/k".into(),
                value: b"1".to_vec()
            }
        );
        // The /b/ key is filtered by prefix; next event is the delete.
        assert_eq!(
            next_event(&mut watch).await,
            WatchEvent::Delete { key: "/a/k".into() }
        );
    }

    #[tokio::test]
    async fn test_watch_sees_expiry_as_delete() {
        let store = MemoryCoordinator::new();
        let lease = store.grant(TTL).await.unwrap();
        store.put_if_absent("/a/k", b"1".to_vec(), lease).await.unwrap();
        let mut watch = store.watch("/a/").await.unwrap();

        // No keepalive: the janitor expires the lease.
        assert_eq!(
            next_event(&mut watch).await,
            WatchEvent::Delete { key: "/a/k".into() }
        );
    }
}
