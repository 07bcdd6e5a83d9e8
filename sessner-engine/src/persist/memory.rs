use std::{
    cmp::{max, Reverse},
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use glob::Pattern;
use parking_lot::{RwLock, RwLockWriteGuard};
use priority_queue::PriorityQueue;
use serde_json::Value;

use super::interface::{DocumentStore, KeyValueLayer};
use crate::{utils::now_millis, Error, Result};

struct Entry {
    value: String,
    written_at: i64,
}

enum Bound {
    None,
    /// Evict oldest entries past this count (ephemeral-layer semantics).
    Capacity(usize),
    /// Reject writes past this byte budget (durable-layer semantics).
    QuotaBytes(usize),
}

/// In-memory key-value layer.
///
/// Stands in for both host storage layers: with [`MemoryLayer::with_capacity`]
/// it behaves like the ephemeral layer and evicts the oldest entries under
/// pressure; with [`MemoryLayer::with_quota`] it behaves like the bounded
/// durable layer and fails writes with `StorageQuotaExceeded` instead of
/// dropping data.
#[derive(Clone)]
pub struct MemoryLayer {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    bound: Arc<Bound>,
}

impl MemoryLayer {
    pub fn new() -> Self {
        Self {
            data: Default::default(),
            bound: Arc::new(Bound::None),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Default::default(),
            bound: Arc::new(Bound::Capacity(capacity)),
        }
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            data: Default::default(),
            bound: Arc::new(Bound::QuotaBytes(quota_bytes)),
        }
    }

    /// Evict up to `num` entries, oldest write first. Returns evicted count.
    fn gc(&self, wlock: &mut RwLockWriteGuard<HashMap<String, Entry>>, num: usize) -> usize {
        let mut queue = PriorityQueue::new();
        for (k, v) in wlock.iter() {
            queue.push(k.to_owned(), Reverse(v.written_at));
        }
        let mut evicted = 0;
        for _ in 0..num {
            match queue.pop() {
                Some((k, _)) => {
                    wlock.remove(&k);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn used_bytes(data: &HashMap<String, Entry>) -> usize {
        data.iter().map(|(k, v)| k.len() + v.value.len()).sum()
    }
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueLayer for MemoryLayer {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut wlock = self.data.write();
        match &*self.bound {
            &Bound::Capacity(cap) => {
                if wlock.len() >= cap && !wlock.contains_key(key) {
                    self.gc(&mut wlock, max(cap / 10, 1));
                }
            }
            &Bound::QuotaBytes(quota) => {
                let replaced = wlock.get(key).map(|e| key.len() + e.value.len()).unwrap_or(0);
                let after = Self::used_bytes(&wlock) - replaced + key.len() + value.len();
                if after > quota {
                    return Err(Error::StorageQuotaExceeded(format!(
                        "{after} bytes would exceed the {quota} byte budget"
                    )));
                }
            }
            Bound::None => {}
        }
        wlock.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                written_at: now_millis(),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let p = Pattern::new(pattern).map_err(anyhow::Error::from)?;
        let mut keys: Vec<_> = self
            .data
            .read()
            .keys()
            .filter(|k| p.matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }
}

/// In-memory document store with named object stores.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    stores: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, store: &str, key: &str, doc: Value) -> Result<()> {
        self.stores
            .write()
            .entry(store.to_owned())
            .or_default()
            .insert(key.to_owned(), doc);
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .stores
            .read()
            .get(store)
            .and_then(|s| s.get(key))
            .cloned())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        Ok(self
            .stores
            .write()
            .get_mut(store)
            .is_some_and(|s| s.remove(key).is_some()))
    }

    async fn keys(&self, store: &str) -> Result<Vec<String>> {
        Ok(self
            .stores
            .read()
            .get(store)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.stores.write().remove(store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_del_keys() {
        let layer = MemoryLayer::new();
        assert_eq!(layer.get("k").await.unwrap(), None);
        layer.set("k", "v1").await.unwrap();
        layer.set("k", "v2").await.unwrap();
        assert_eq!(layer.get("k").await.unwrap().unwrap(), "v2");

        layer.set("sessner_license", "{}").await.unwrap();
        layer.set("sessner_device_id", "abc").await.unwrap();
        assert_eq!(
            layer.keys("sessner_*").await.unwrap(),
            vec!["sessner_device_id", "sessner_license"]
        );

        assert!(layer.del("k").await.unwrap());
        assert!(!layer.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn capacity_mode_evicts_oldest() {
        let layer = MemoryLayer::with_capacity(3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            layer.set(key, &i.to_string()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        layer.set("d", "3").await.unwrap();
        assert_eq!(layer.get("a").await.unwrap(), None);
        assert_eq!(layer.get("d").await.unwrap().unwrap(), "3");
    }

    #[tokio::test]
    async fn quota_mode_rejects_instead_of_dropping() {
        let layer = MemoryLayer::with_quota(16);
        layer.set("k", "0123456789").await.unwrap();
        let err = layer.set("big", "0123456789abcdef").await.unwrap_err();
        assert!(matches!(err, Error::StorageQuotaExceeded(_)));
        // the old value survives
        assert_eq!(layer.get("k").await.unwrap().unwrap(), "0123456789");
        // replacing in place within budget is fine
        layer.set("k", "xyz").await.unwrap();
    }

    #[tokio::test]
    async fn document_store_object_stores_are_independent() {
        let docs = MemoryDocumentStore::new();
        docs.put("sessions", "s1", serde_json::json!({"id": "s1"}))
            .await
            .unwrap();
        docs.put("cookies", "s1", serde_json::json!({})).await.unwrap();
        assert_eq!(docs.keys("sessions").await.unwrap(), vec!["s1"]);
        docs.clear("sessions").await.unwrap();
        assert!(docs.keys("sessions").await.unwrap().is_empty());
        assert!(docs.get("cookies", "s1").await.unwrap().is_some());
    }
}
