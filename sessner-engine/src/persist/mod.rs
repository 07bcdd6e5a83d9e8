//! Durable state across host-process restarts.
//!
//! Three layers, queried in priority order on restore: the ephemeral
//! key-value layer (survives UI suspends, not restarts), the bounded
//! durable key-value layer, and the transactional document store. Writes
//! mirror to the two durable layers; the ephemeral layer is updated
//! synchronously on every mutation.

mod interface;
mod memory;

pub use interface::{DocumentStore, KeyValueLayer};
pub use memory::{MemoryDocumentStore, MemoryLayer};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::{store::Snapshot, utils::now_millis, Error, Result};

pub const KEY_SESSION_STORE: &str = "sessionStore";
pub const KEY_DEVICE_ID: &str = "sessner_device_id";
pub const KEY_LICENSE: &str = "sessner_license";
pub const KEY_PENDING_UPDATE: &str = "pendingUpdate";
pub const KEY_AUTO_RESTORE: &str = "autoRestorePreference";

const DOC_SESSIONS: &str = "sessions";
const DOC_COOKIES: &str = "cookies";
const DOC_TAB_MAPPINGS: &str = "tabMappings";
const DOC_TAB_METADATA: &str = "tabMetadata";

/// Every persisted record carries a `_lastSaved` stamp for debugging.
#[derive(Serialize, Deserialize)]
struct PersistedRecord<T> {
    #[serde(flatten)]
    value: T,
    #[serde(rename = "_lastSaved")]
    last_saved: i64,
}

/// Which layer satisfied a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    Ephemeral,
    Durable,
    Documents,
}

#[derive(Clone)]
pub struct PersistenceManager {
    ephemeral: Arc<dyn KeyValueLayer>,
    durable: Arc<dyn KeyValueLayer>,
    documents: Arc<dyn DocumentStore>,
    debounce: std::time::Duration,
    pending: Arc<AsyncMutex<Option<Snapshot>>>,
    flusher_active: Arc<AtomicBool>,
}

impl PersistenceManager {
    pub fn new(
        ephemeral: Arc<dyn KeyValueLayer>,
        durable: Arc<dyn KeyValueLayer>,
        documents: Arc<dyn DocumentStore>,
        debounce: std::time::Duration,
    ) -> Self {
        Self {
            ephemeral,
            durable,
            documents,
            debounce,
            pending: Arc::new(AsyncMutex::new(None)),
            flusher_active: Arc::new(AtomicBool::new(false)),
        }
    }

    fn encode<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(&PersistedRecord {
            value,
            last_saved: now_millis(),
        })?)
    }

    fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
        let record: PersistedRecord<T> = serde_json::from_str(raw)?;
        Ok(record.value)
    }

    /// Write the snapshot through every layer. Used for the immediate
    /// policy: session create/delete, emptying unbind, license changes,
    /// import completion.
    pub async fn save_now(&self, snapshot: &Snapshot) -> Result<()> {
        let encoded = Self::encode(snapshot)?;
        self.ephemeral.set(KEY_SESSION_STORE, &encoded).await?;
        self.durable.set(KEY_SESSION_STORE, &encoded).await?;
        self.mirror_documents(snapshot).await?;
        Ok(())
    }

    /// Debounced write for rapid mutation streams (cookie captures,
    /// storage activity). The ephemeral layer is written immediately;
    /// durable layers coalesce over the debounce window, keeping only the
    /// latest snapshot.
    pub async fn save_debounced(&self, snapshot: Snapshot) {
        if let Ok(encoded) = Self::encode(&snapshot) {
            if let Err(e) = self.ephemeral.set(KEY_SESSION_STORE, &encoded).await {
                warn!(error = %e, "ephemeral write failed");
            }
        }
        *self.pending.lock().await = Some(snapshot);
        if self
            .flusher_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.debounce).await;
                let Some(snapshot) = this.pending.lock().await.take() else {
                    break;
                };
                if let Err(e) = this.save_now(&snapshot).await {
                    warn!(error = %e, "debounced flush failed, state kept in memory");
                }
            }
            this.flusher_active.store(false, Ordering::SeqCst);
            // a snapshot that arrived while the flag was being cleared
            let leftover = this.pending.lock().await.take();
            if let Some(snapshot) = leftover {
                if let Err(e) = this.save_now(&snapshot).await {
                    warn!(error = %e, "debounced flush failed, state kept in memory");
                }
            }
        });
    }

    /// Force out any coalesced snapshot (keep-alive task).
    pub async fn flush_pending(&self) -> Result<()> {
        let snapshot = self.pending.lock().await.take();
        match snapshot {
            Some(s) => self.save_now(&s).await,
            None => Ok(()),
        }
    }

    async fn mirror_documents(&self, snapshot: &Snapshot) -> Result<()> {
        for store in [DOC_SESSIONS, DOC_COOKIES, DOC_TAB_MAPPINGS, DOC_TAB_METADATA] {
            self.documents.clear(store).await?;
        }
        for (id, session) in &snapshot.sessions {
            self.documents
                .put(DOC_SESSIONS, id, serde_json::to_value(session)?)
                .await?;
        }
        for (id, jar) in &snapshot.cookie_store {
            self.documents
                .put(DOC_COOKIES, id, serde_json::to_value(jar)?)
                .await?;
        }
        self.documents
            .put(
                DOC_TAB_MAPPINGS,
                "bindings",
                serde_json::to_value(&snapshot.tab_to_session)?,
            )
            .await?;
        for (tab, session_id) in &snapshot.tab_to_session {
            self.documents
                .put(
                    DOC_TAB_METADATA,
                    &tab.to_string(),
                    serde_json::json!({ "sessionId": session_id }),
                )
                .await?;
        }
        Ok(())
    }

    /// Restore from the highest-priority layer holding a decodable
    /// snapshot. `Ok(None)` means a clean first run.
    pub async fn restore(&self) -> Result<Option<(Snapshot, RestoreSource)>> {
        for (layer, source) in [
            (&self.ephemeral, RestoreSource::Ephemeral),
            (&self.durable, RestoreSource::Durable),
        ] {
            match layer.get(KEY_SESSION_STORE).await {
                Ok(Some(raw)) => match Self::decode::<Snapshot>(&raw) {
                    Ok(snapshot) => {
                        debug!(?source, "state restored");
                        return Ok(Some((snapshot, source)));
                    }
                    Err(e) => warn!(?source, error = %e, "corrupt snapshot skipped"),
                },
                Ok(None) => {}
                Err(e) => warn!(?source, error = %e, "restore layer unavailable"),
            }
        }
        match self.restore_from_documents().await {
            Ok(Some(snapshot)) => Ok(Some((snapshot, RestoreSource::Documents))),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "document-store restore failed");
                Ok(None)
            }
        }
    }

    async fn restore_from_documents(&self) -> Result<Option<Snapshot>> {
        let session_ids = self.documents.keys(DOC_SESSIONS).await?;
        if session_ids.is_empty() {
            return Ok(None);
        }
        let mut snapshot = Snapshot::default();
        for id in session_ids {
            if let Some(doc) = self.documents.get(DOC_SESSIONS, &id).await? {
                snapshot
                    .sessions
                    .insert(id.clone(), serde_json::from_value(doc)?);
            }
            if let Some(doc) = self.documents.get(DOC_COOKIES, &id).await? {
                snapshot
                    .cookie_store
                    .insert(id.clone(), serde_json::from_value(doc)?);
            }
        }
        if let Some(doc) = self.documents.get(DOC_TAB_MAPPINGS, "bindings").await? {
            snapshot.tab_to_session = serde_json::from_value(doc)?;
        }
        Ok(Some(snapshot))
    }

    /// Small persisted values (device id, license record, preferences).
    /// These follow the immediate write policy and are mirrored to both
    /// durable layers.
    pub async fn put_value<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.ephemeral.set(key, &encoded).await?;
        self.durable.set(key, &encoded).await?;
        Ok(())
    }

    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        for layer in [&self.ephemeral, &self.durable] {
            if let Some(raw) = layer.get(key).await? {
                return Ok(Some(serde_json::from_str(&raw)?));
            }
        }
        Ok(None)
    }

    pub async fn delete_value(&self, key: &str) -> Result<bool> {
        self.ephemeral.del(key).await?;
        self.durable.del(key).await
    }

    /// Count of keys in the durable layer, for keep-alive stats.
    pub async fn persisted_key_count(&self) -> usize {
        self.durable.keys("*").await.map(|k| k.len()).unwrap_or(0)
    }

    /// Map a storage failure to the error surfaced to user operations
    /// while the in-memory state is retained.
    pub fn quota_error(e: &Error) -> bool {
        matches!(e, Error::StorageQuotaExceeded(_))
    }

    pub async fn dump_document(&self, store: &str, key: &str) -> Result<Option<Value>> {
        self.documents.get(store, key).await
    }
}
