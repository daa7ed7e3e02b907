//! File-mode `ChannelStore` backend.
//!
//! Atomic-ish write sequence: snapshot -> timestamped backup (keep last N)
//! -> write JSON -> swap in-memory state. A `notify` watcher reloads on
//! external writes, matching the donor's background-task-with-shutdown-signal
//! idiom (`standby::spawn_leadership_monitor`) for its own reload loop.

use crate::document::GatewayDocument;
use crate::error::{ChannelStoreError, Result};
use crate::mutations::{self, ChannelPatch, UpdateOutcome};
use crate::store::ChannelStore;
use async_trait::async_trait;
use fc_common::{Channel, PoolKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct FileChannelStore {
    path: PathBuf,
    backup_count: usize,
    state: Arc<RwLock<GatewayDocument>>,
}

impl FileChannelStore {
    pub fn open(path: impl AsRef<Path>, backup_count: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut doc = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            GatewayDocument::default()
        };

        let migrated = mutations::run_load_migrations(&mut doc);

        let store = Self {
            path,
            backup_count,
            state: Arc::new(RwLock::new(doc)),
        };

        if migrated {
            store.persist_locked()?;
        }

        Ok(store)
    }

    fn persist_locked(&self) -> Result<()> {
        let doc = self.state.read();
        self.write_with_backup(&doc)
    }

    fn write_with_backup(&self, doc: &GatewayDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            self.rotate_backup()?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn rotate_backup(&self) -> Result<()> {
        let Some(parent) = self.path.parent() else { return Ok(()) };
        let backup_dir = parent.join("backups");
        std::fs::create_dir_all(&backup_dir)?;
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let backup_path = backup_dir.join(format!("config-{timestamp}.json"));
        std::fs::copy(&self.path, &backup_path)?;

        let mut backups: Vec<_> = std::fs::read_dir(&backup_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("config-"))
            .collect();
        backups.sort_by_key(|e| e.file_name());
        while backups.len() > self.backup_count {
            let oldest = backups.remove(0);
            let _ = std::fs::remove_file(oldest.path());
        }
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut GatewayDocument) -> Result<T>,
    ) -> Result<T> {
        let mut doc = self.state.write();
        let result = f(&mut doc)?;
        self.write_with_backup(&doc)?;
        Ok(result)
    }

    /// Spawns a filesystem watcher that reloads the document whenever the
    /// backing file changes outside this process. Debounced per write event.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<RecommendedWatcher> {
        let state = self.state.clone();
        let path = self.path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            if !event.kind.is_modify() && !event.kind.is_create() {
                return;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<GatewayDocument>(&content) {
                    Ok(mut doc) => {
                        mutations::run_load_migrations(&mut doc);
                        *state.write() = doc;
                        info!(?path, "reloaded channel store after external write");
                    }
                    Err(err) => warn!(%err, "failed to parse externally-modified channel store file"),
                },
                Err(err) => warn!(%err, "failed to read externally-modified channel store file"),
            }
        })
        .map_err(|e| ChannelStoreError::Persistence(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            watcher
                .watch(parent, RecursiveMode::NonRecursive)
                .map_err(|e| ChannelStoreError::Persistence(e.to_string()))?;
        }
        Ok(watcher)
    }
}

#[async_trait]
impl ChannelStore for FileChannelStore {
    async fn get_all(&self, kind: PoolKind) -> Result<Vec<Channel>> {
        Ok(mutations::get_all(&self.state.read(), kind))
    }

    async fn get_current(&self, kind: PoolKind) -> Result<Channel> {
        mutations::get_current(&self.state.read(), kind)
    }

    async fn add(&self, kind: PoolKind, channel: Channel) -> Result<Channel> {
        self.mutate(|doc| mutations::add(doc, kind, channel))
    }

    async fn update(&self, kind: PoolKind, index: usize, patch: ChannelPatch) -> Result<UpdateOutcome> {
        self.mutate(|doc| mutations::update(doc, kind, index, patch))
    }

    async fn remove(&self, kind: PoolKind, index: usize) -> Result<Channel> {
        self.mutate(|doc| mutations::remove(doc, kind, index))
    }

    async fn set_status(&self, kind: PoolKind, index: usize, status: &str) -> Result<()> {
        self.mutate(|doc| mutations::set_status(doc, kind, index, status))
    }

    async fn set_promotion(&self, kind: PoolKind, index: usize, duration_secs: i64) -> Result<()> {
        self.mutate(|doc| mutations::set_promotion(doc, kind, index, duration_secs))
    }

    async fn reorder(&self, kind: PoolKind, index_list: &[usize]) -> Result<()> {
        self.mutate(|doc| mutations::reorder(doc, kind, index_list))
    }

    async fn add_api_key(&self, kind: PoolKind, index: usize, key: String) -> Result<()> {
        self.mutate(|doc| mutations::add_api_key(doc, kind, index, key))
    }

    async fn remove_api_key_by_index(&self, kind: PoolKind, index: usize, key_index: usize) -> Result<()> {
        self.mutate(|doc| mutations::remove_api_key_by_index(doc, kind, index, key_index))
    }

    async fn move_api_key_top_by_index(&self, kind: PoolKind, index: usize, key_index: usize) -> Result<()> {
        self.mutate(|doc| mutations::move_api_key_top_by_index(doc, kind, index, key_index))
    }

    async fn move_api_key_bottom_by_index(&self, kind: PoolKind, index: usize, key_index: usize) -> Result<()> {
        self.mutate(|doc| mutations::move_api_key_bottom_by_index(doc, kind, index, key_index))
    }

    async fn deprioritize_api_key(&self, key: &str) -> Result<()> {
        self.mutate(|doc| {
            mutations::deprioritize_api_key(doc, key);
            Ok(())
        })
    }

    async fn snapshot(&self) -> Result<GatewayDocument> {
        Ok(self.state.read().clone())
    }

    async fn set_debug_log_settings(&self, settings: crate::document::DebugLogSettings) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_debug_log_settings(doc, settings);
            Ok(())
        })
    }

    async fn set_failover_settings(&self, settings: crate::document::FailoverSettings) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_failover_settings(doc, settings);
            Ok(())
        })
    }

    async fn set_user_agent_settings(&self, settings: crate::document::UserAgentSettings) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_user_agent_settings(doc, settings);
            Ok(())
        })
    }

    async fn set_load_balance(&self, kind: PoolKind, strategy: Option<fc_common::LoadBalanceStrategy>) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_load_balance(doc, kind, strategy);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::ChannelStatus;

    fn sample(name: &str) -> Channel {
        Channel {
            id: String::new(),
            index: None,
            name: name.to_string(),
            service_type: fc_common::ServiceType::Claude,
            base_url: "https://example.test".into(),
            api_keys: vec!["sk-1".into()],
            oauth_tokens: None,
            model_mapping: Default::default(),
            priority: 0,
            status: ChannelStatus::Active,
            promotion_until: None,
            quota: None,
            rate_limit_rpm: None,
            key_load_balance: None,
            content_filter: None,
            composite_mappings: None,
            price_multipliers: Default::default(),
        }
    }

    #[tokio::test]
    async fn save_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let store = FileChannelStore::open(&path, 10).unwrap();
        store.add(PoolKind::Messages, sample("A")).await.unwrap();

        let reopened = FileChannelStore::open(&path, 10).unwrap();
        let channels = reopened.get_all(PoolKind::Messages).await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "A");
    }

    #[tokio::test]
    async fn backups_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let store = FileChannelStore::open(&path, 2).unwrap();
        for i in 0..5 {
            store.add(PoolKind::Messages, sample(&format!("C{i}"))).await.unwrap();
        }
        let backup_dir = dir.path().join("backups");
        let count = std::fs::read_dir(&backup_dir).unwrap().count();
        assert!(count <= 2, "expected at most 2 backups, found {count}");
    }

    #[tokio::test]
    async fn empty_pool_get_current_is_no_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let store = FileChannelStore::open(&path, 10).unwrap();
        let err = store.get_current(PoolKind::Messages).await.unwrap_err();
        assert!(matches!(err, ChannelStoreError::NoChannels));
    }
}
