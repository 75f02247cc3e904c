//! Build configuration records keyed by build ID.

use buildq_core::{BuildConfig, BuildId, KvStore, Result, StopConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Access to the hash where producers park full build configurations
/// until a worker picks them up.
#[derive(Clone)]
pub struct BuildConfigStore {
    store: Arc<dyn KvStore>,
    key: String,
}

impl BuildConfigStore {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Park a configuration, replacing any previous record for the build.
    pub async fn put(&self, config: &BuildConfig) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        self.store
            .set(&self.key, &config.build_id.as_field(), &raw)
            .await
    }

    /// Read the record for a build and remove it.
    ///
    /// Returns `None` when there is no record or when another worker
    /// removed it first; only the caller whose delete succeeded gets the
    /// configuration.
    pub async fn fetch_and_consume(&self, build_id: BuildId) -> Result<Option<BuildConfig>> {
        let field = build_id.as_field();

        let Some(raw) = self.store.get(&self.key, &field).await? else {
            debug!(build_id = %build_id, "No build config on record");
            return Ok(None);
        };
        let config: BuildConfig = serde_json::from_str(&raw)?;

        if !self.store.delete(&self.key, &field).await? {
            info!(build_id = %build_id, "Build config consumed by another worker");
            return Ok(None);
        }

        Ok(Some(config))
    }

    /// Resolve what a stop needs and remove the record.
    ///
    /// The read is best effort: a missing, unreadable or malformed record
    /// yields a bare stop config. The delete always runs and its failure
    /// is returned.
    pub async fn fetch_for_stop(&self, build_id: BuildId) -> Result<StopConfig> {
        let field = build_id.as_field();

        let annotations = match self.store.get(&self.key, &field).await {
            Ok(Some(raw)) => match serde_json::from_str::<BuildConfig>(&raw) {
                Ok(config) => config.annotations,
                Err(e) => {
                    warn!(build_id = %build_id, error = %e, "Ignoring malformed build config");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "Failed to read build config for stop");
                None
            }
        };

        self.store.delete(&self.key, &field).await?;

        Ok(StopConfig {
            build_id,
            annotations,
        })
    }
}
