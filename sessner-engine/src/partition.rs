//! Web-storage partitioning.
//!
//! A transparent interposer over the page's key-value storage objects
//! that rewrites every operation against a per-session prefix. The
//! session id arrives asynchronously from the engine; until it does,
//! writes queue in order and reads refuse. When every acquisition
//! attempt fails the partition fails closed — it never falls back to an
//! unprefixed or shared-default key space.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tracing::debug;

use crate::{Error, Result};

/// Retry schedule for fetching the session id from the engine.
pub const ACQUIRE_BACKOFF_MILLIS: [u64; 5] = [100, 500, 1_000, 2_000, 3_000];

pub fn storage_prefix(session_id: &str) -> String {
    format!("__SID_{session_id}__")
}

/// The page's underlying storage object (ephemeral or persistent).
pub trait PageStorage {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// Shared in-memory stand-in for a page storage object. Clones share the
/// same key space, the way every frame of a tab shares `localStorage`.
#[derive(Clone, Default)]
pub struct MemoryPageStorage {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryPageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_len(&self) -> usize {
        self.data.read().len()
    }
}

impl PageStorage for MemoryPageStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        self.data.write().insert(key.to_owned(), value.to_owned());
    }

    fn remove_item(&self, key: &str) {
        self.data.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum QueuedOp {
    Set(String, String),
    Remove(String),
    Clear,
}

enum PartitionState {
    Pending { queued: Vec<QueuedOp>, attempts: usize },
    Ready { prefix: String },
    Failed,
}

/// The interposer installed over one storage object in one page realm.
pub struct PartitionedStorage<S: PageStorage> {
    underlying: S,
    state: PartitionState,
}

impl<S: PageStorage> PartitionedStorage<S> {
    pub fn new(underlying: S) -> Self {
        Self {
            underlying,
            state: PartitionState::Pending {
                queued: Vec::new(),
                attempts: 0,
            },
        }
    }

    /// Install directly with a known session id (same-document
    /// navigation where the id is already cached).
    pub fn with_session(underlying: S, session_id: &str) -> Self {
        Self {
            underlying,
            state: PartitionState::Ready {
                prefix: storage_prefix(session_id),
            },
        }
    }

    /// The engine answered: replay the queue in order under the prefix.
    pub fn resolve(&mut self, session_id: &str) {
        let prefix = storage_prefix(session_id);
        if let PartitionState::Pending { queued, .. } = &mut self.state {
            let queued = std::mem::take(queued);
            debug!(replayed = queued.len(), "storage partition resolved");
            for op in queued {
                match op {
                    QueuedOp::Set(k, v) => self.underlying.set_item(&format!("{prefix}{k}"), &v),
                    QueuedOp::Remove(k) => self.underlying.remove_item(&format!("{prefix}{k}")),
                    QueuedOp::Clear => clear_prefixed(&self.underlying, &prefix),
                }
            }
        }
        self.state = PartitionState::Ready { prefix };
    }

    /// An acquisition attempt failed. Returns the delay before the next
    /// attempt, or `None` when the schedule is exhausted and the
    /// partition has failed closed.
    pub fn acquisition_failed(&mut self) -> Option<Duration> {
        match &mut self.state {
            PartitionState::Pending { attempts, .. } => {
                let next = ACQUIRE_BACKOFF_MILLIS.get(*attempts).copied();
                *attempts += 1;
                match next {
                    Some(ms) => Some(Duration::from_millis(ms)),
                    None => {
                        self.state = PartitionState::Failed;
                        None
                    }
                }
            }
            _ => None,
        }
    }

    fn prefix(&self) -> Result<&str> {
        match &self.state {
            PartitionState::Ready { prefix } => Ok(prefix),
            PartitionState::Pending { .. } => Err(Error::PersistenceFailure(
                "storage partition is waiting for its session identity".into(),
            )),
            PartitionState::Failed => Err(Error::PersistenceFailure(
                "storage partition failed closed: no session identity".into(),
            )),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let prefix = self.prefix()?;
        Ok(self.underlying.get_item(&format!("{prefix}{key}")))
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match &mut self.state {
            PartitionState::Ready { prefix } => {
                self.underlying.set_item(&format!("{prefix}{key}"), value);
                Ok(())
            }
            PartitionState::Pending { queued, .. } => {
                queued.push(QueuedOp::Set(key.to_owned(), value.to_owned()));
                Ok(())
            }
            PartitionState::Failed => Err(Error::PersistenceFailure(
                "storage partition failed closed: no session identity".into(),
            )),
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<()> {
        match &mut self.state {
            PartitionState::Ready { prefix } => {
                self.underlying.remove_item(&format!("{prefix}{key}"));
                Ok(())
            }
            PartitionState::Pending { queued, .. } => {
                queued.push(QueuedOp::Remove(key.to_owned()));
                Ok(())
            }
            PartitionState::Failed => Err(Error::PersistenceFailure(
                "storage partition failed closed: no session identity".into(),
            )),
        }
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Visible keys, prefix stripped.
    pub fn keys(&self) -> Result<Vec<String>> {
        let prefix = self.prefix()?;
        Ok(self
            .underlying
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(prefix).map(str::to_owned))
            .collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Delete only this partition's keys.
    pub fn clear(&mut self) -> Result<()> {
        match &mut self.state {
            PartitionState::Ready { prefix } => {
                let prefix = prefix.clone();
                clear_prefixed(&self.underlying, &prefix);
                Ok(())
            }
            PartitionState::Pending { queued, .. } => {
                queued.push(QueuedOp::Clear);
                Ok(())
            }
            PartitionState::Failed => Err(Error::PersistenceFailure(
                "storage partition failed closed: no session identity".into(),
            )),
        }
    }
}

fn clear_prefixed<S: PageStorage>(storage: &S, prefix: &str) {
    for key in storage.keys() {
        if key.starts_with(prefix) {
            storage.remove_item(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_sessions_share_the_object_but_not_the_keys() {
        let shared = MemoryPageStorage::new();
        let mut a = PartitionedStorage::with_session(shared.clone(), "session_1_a");
        let mut b = PartitionedStorage::with_session(shared.clone(), "session_1_b");

        a.set("user", "alice").unwrap();
        b.set("user", "bob").unwrap();
        assert_eq!(a.get("user").unwrap().as_deref(), Some("alice"));
        assert_eq!(b.get("user").unwrap().as_deref(), Some("bob"));
        assert_eq!(shared.raw_len(), 2);

        a.clear().unwrap();
        assert!(a.is_empty().unwrap());
        assert_eq!(b.get("user").unwrap().as_deref(), Some("bob"));
    }

    #[test]
    fn keys_and_len_strip_the_prefix() {
        let mut s = PartitionedStorage::with_session(MemoryPageStorage::new(), "session_1_x");
        s.set("alpha", "1").unwrap();
        s.set("beta", "2").unwrap();
        let mut keys = s.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["alpha", "beta"]);
        assert_eq!(s.len().unwrap(), 2);
        assert!(s.has("alpha").unwrap());
        s.remove("alpha").unwrap();
        assert!(!s.has("alpha").unwrap());
    }

    #[test]
    fn pending_writes_queue_and_replay_in_order() {
        let shared = MemoryPageStorage::new();
        let mut s = PartitionedStorage::new(shared.clone());
        s.set("a", "first").unwrap();
        s.set("a", "second").unwrap();
        s.set("b", "kept").unwrap();
        s.remove("a").unwrap();
        // nothing hit the underlying object yet
        assert_eq!(shared.raw_len(), 0);
        // reads refuse while pending
        assert!(s.get("b").is_err());

        s.resolve("session_1_q");
        assert_eq!(s.get("a").unwrap(), None);
        assert_eq!(s.get("b").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn backoff_schedule_then_fail_closed() {
        let mut s = PartitionedStorage::new(MemoryPageStorage::new());
        s.set("queued", "1").unwrap();
        let delays: Vec<_> = std::iter::from_fn(|| s.acquisition_failed()).collect();
        assert_eq!(
            delays,
            ACQUIRE_BACKOFF_MILLIS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect::<Vec<_>>()
        );
        // failed closed: every operation errors, nothing leaks unprefixed
        assert!(s.set("x", "y").is_err());
        assert!(s.get("queued").is_err());
        assert!(s.keys().is_err());
        assert!(s.clear().is_err());
    }

    #[test]
    fn resolve_after_failures_still_wins() {
        let mut s = PartitionedStorage::new(MemoryPageStorage::new());
        s.set("k", "v").unwrap();
        s.acquisition_failed();
        s.acquisition_failed();
        s.resolve("session_1_late");
        assert_eq!(s.get("k").unwrap().as_deref(), Some("v"));
    }
}
