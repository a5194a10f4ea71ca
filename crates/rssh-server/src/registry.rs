//! Peer registry for reverse connections.
//!
//! Tracks currently connected reverse peers keyed by the listening address
//! they announced. Each insertion gets a fresh id, so a close watcher from
//! an earlier session can only remove the entry it created.

use rssh_core::PeerMetadata;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

/// A connected reverse peer.
#[derive(Debug, Clone)]
pub struct RegistryEntry<H> {
    pub metadata: PeerMetadata,
    /// Opaque handle to the underlying connection.
    pub handle: H,
    pub remote_addr: String,
    pub registered_at: Instant,
    pub id: u64,
}

/// Proof of one insertion, used to remove exactly that entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    key: String,
    id: u64,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Serializable view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub listening_address: String,
    pub current_user: String,
    pub hostname: String,
    pub remote_addr: String,
    pub connected_secs: u64,
}

/// Registry of reverse peers. Clones share the same table.
pub struct PeerRegistry<H> {
    peers: Arc<RwLock<HashMap<String, RegistryEntry<H>>>>,
    next_id: Arc<AtomicU64>,
}

impl<H> Clone for PeerRegistry<H> {
    fn clone(&self) -> Self {
        Self {
            peers: self.peers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<H> Default for PeerRegistry<H> {
    fn default() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<H: Clone> PeerRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under `metadata.listening_address`, replacing any previous
    /// entry for that address.
    pub async fn insert(&self, metadata: PeerMetadata, remote_addr: String, handle: H) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = metadata.listening_address.clone();
        let entry = RegistryEntry {
            metadata,
            handle,
            remote_addr,
            registered_at: Instant::now(),
            id,
        };

        let mut peers = self.peers.write().await;
        if let Some(old) = peers.insert(key.clone(), entry) {
            debug!(address = %key, old_id = old.id, id, "replaced registry entry");
        }
        Registration { key, id }
    }

    /// Remove the entry created by `registration`. A newer entry under the
    /// same address is left alone.
    pub async fn remove(&self, registration: &Registration) -> Option<RegistryEntry<H>> {
        let mut peers = self.peers.write().await;
        match peers.get(&registration.key) {
            Some(entry) if entry.id == registration.id => peers.remove(&registration.key),
            _ => None,
        }
    }

    pub async fn get(&self, listening_address: &str) -> Option<RegistryEntry<H>> {
        self.peers.read().await.get(listening_address).cloned()
    }

    /// All entries, ordered by listening address.
    pub async fn list(&self) -> Vec<RegistryEntry<H>> {
        let peers = self.peers.read().await;
        let mut entries: Vec<_> = peers.values().cloned().collect();
        entries.sort_by(|a, b| a.metadata.listening_address.cmp(&b.metadata.listening_address));
        entries
    }

    pub async fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.list()
            .await
            .into_iter()
            .map(|e| PeerSnapshot {
                listening_address: e.metadata.listening_address,
                current_user: e.metadata.current_user,
                hostname: e.metadata.hostname,
                remote_addr: e.remote_addr,
                connected_secs: e.registered_at.elapsed().as_secs(),
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use std::collections::BTreeSet;

    fn meta(addr: &str) -> PeerMetadata {
        PeerMetadata::new("root", "box", addr)
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let reg = PeerRegistry::new();
        let a = reg.insert(meta("0.0.0.0:1"), "r1".into(), 1u32).await;
        let b = reg.insert(meta("0.0.0.0:2"), "r2".into(), 2u32).await;
        assert_eq!(reg.count().await, 2);
        assert_ne!(a, b);

        assert_eq!(reg.remove(&a).await.unwrap().handle, 1);
        assert!(reg.get("0.0.0.0:1").await.is_none());
        assert_eq!(reg.get("0.0.0.0:2").await.unwrap().handle, 2);
        assert_eq!(b.key(), "0.0.0.0:2");
    }

    #[tokio::test]
    async fn stale_removal_keeps_fresh_entry() {
        let reg = PeerRegistry::new();
        let old = reg.insert(meta("0.0.0.0:9"), "r1".into(), "old").await;
        let fresh = reg.insert(meta("0.0.0.0:9"), "r2".into(), "fresh").await;
        assert_eq!(reg.count().await, 1);

        assert!(reg.remove(&old).await.is_none());
        assert_eq!(reg.get("0.0.0.0:9").await.unwrap().handle, "fresh");

        assert!(reg.remove(&fresh).await.is_some());
        assert!(reg.remove(&fresh).await.is_none());
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn reinsert_after_removal_has_new_data() {
        let reg = PeerRegistry::new();
        let first = reg.insert(meta("0.0.0.0:5"), "r1".into(), 1u8).await;
        reg.remove(&first).await;
        let mut m = meta("0.0.0.0:5");
        m.hostname = "other".into();
        reg.insert(m, "r2".into(), 2u8).await;

        let entry = reg.get("0.0.0.0:5").await.unwrap();
        assert_eq!(entry.metadata.hostname, "other");
        assert_eq!(entry.remote_addr, "r2");
        assert!(entry.id > first.id);
    }

    #[tokio::test]
    async fn list_and_snapshot_are_sorted() {
        let reg = PeerRegistry::new();
        for addr in ["0.0.0.0:3", "0.0.0.0:1", "0.0.0.0:2"] {
            reg.insert(meta(addr), format!("from-{addr}"), ()).await;
        }
        let keys: Vec<_> = reg
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.listening_address)
            .collect();
        assert_eq!(keys, vec!["0.0.0.0:1", "0.0.0.0:2", "0.0.0.0:3"]);
        assert_eq!(reg.list().await[0].remote_addr, "from-0.0.0.0:1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cycles_leave_exactly_open_keys() {
        for _round in 0..8 {
            let reg: PeerRegistry<usize> = PeerRegistry::new();
            let mut rng = rand::thread_rng();
            let n = 64;
            let closes: Vec<bool> = (0..n).map(|_| rng.gen_bool(0.5)).collect();
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rng);

            let mut tasks = Vec::new();
            for i in order {
                let reg = reg.clone();
                let close = closes[i];
                let delay = rng.gen_range(0..200);
                tasks.push(tokio::spawn(async move {
                    for _ in 0..delay {
                        tokio::task::yield_now().await;
                    }
                    let registration = reg
                        .insert(meta(&format!("0.0.0.0:{i}")), format!("peer-{i}"), i)
                        .await;
                    tokio::task::yield_now().await;
                    if close {
                        assert!(reg.remove(&registration).await.is_some());
                    }
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }

            let expected: BTreeSet<String> = (0..n)
                .filter(|i| !closes[*i])
                .map(|i| format!("0.0.0.0:{i}"))
                .collect();
            let actual: BTreeSet<String> = reg
                .list()
                .await
                .into_iter()
                .map(|e| e.metadata.listening_address)
                .collect();
            assert_eq!(actual, expected);
        }
    }
}
