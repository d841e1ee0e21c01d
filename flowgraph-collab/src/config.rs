//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use flowgraph_core::DocumentOptions;

use crate::provider::ProviderConfig;
use crate::storage::StoreConfig;

/// Everything a [`crate::CollabSession`] needs besides the pipeline id.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: String,
    pub user_name: String,
    /// Bound on the WebSocket handshake in `connect`
    pub handshake_timeout: Duration,
    /// Operations between automatic snapshots
    pub auto_snapshot_threshold: u64,
    /// Remote presence silent for this long is dropped
    pub presence_idle_timeout: Duration,
    /// Local durable store (None = memory only)
    pub storage: Option<StoreConfig>,
    /// Persisted deltas folded into a full snapshot once this many pile up
    pub compaction_threshold: u64,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            handshake_timeout: Duration::from_secs(10),
            auto_snapshot_threshold: 500,
            presence_idle_timeout: Duration::from_secs(30),
            storage: None,
            compaction_threshold: 100,
        }
    }

    /// Short timeouts and a small store under `path`.
    pub fn for_testing(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(2),
            presence_idle_timeout: Duration::from_secs(5),
            storage: path.map(StoreConfig::for_testing),
            compaction_threshold: 16,
            ..Self::new(user_id, user_name)
        }
    }

    pub fn with_storage(mut self, storage: StoreConfig) -> Self {
        self.storage = Some(storage);
        self
    }

    pub(crate) fn document_options(&self) -> DocumentOptions {
        DocumentOptions {
            auto_snapshot_threshold: self.auto_snapshot_threshold,
            client_id: None,
        }
    }

    pub(crate) fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            handshake_timeout: self.handshake_timeout,
            presence_idle_timeout: self.presence_idle_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("u1", "Alice");
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.auto_snapshot_threshold, 500);
        assert_eq!(config.presence_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.compaction_threshold, 100);
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_for_testing_keeps_identity() {
        let config = SessionConfig::for_testing("u1", "Alice", Some(PathBuf::from("/tmp/x")));
        assert_eq!(config.user_id, "u1");
        assert_eq!(config.user_name, "Alice");
        assert_eq!(config.auto_snapshot_threshold, 500);
        assert_eq!(
            config.storage.map(|s| s.path),
            Some(PathBuf::from("/tmp/x"))
        );
    }
}
