//! Key/value store abstraction used for build-config hand-off.

use async_trait::async_trait;

use crate::Result;

/// Hash-shaped key/value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Remove `field` from `key`, returning whether this call removed it.
    ///
    /// Only one of several concurrent callers may observe `true`.
    async fn delete(&self, key: &str, field: &str) -> Result<bool>;
}
