use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// A host key-value storage layer (ephemeral or durable).
///
/// Implementations are internally synchronized; callers hold `&self`.
#[async_trait]
pub trait KeyValueLayer: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn flush(&self) -> Result<()>;
}

/// The host's transactional document store, organized in named object
/// stores. Larger capacity than the key-value layers; used as the backup
/// restore source and for bulky per-session records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, store: &str, key: &str, doc: Value) -> Result<()>;

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>>;

    async fn delete(&self, store: &str, key: &str) -> Result<bool>;

    async fn keys(&self, store: &str) -> Result<Vec<String>>;

    async fn clear(&self, store: &str) -> Result<()>;
}
