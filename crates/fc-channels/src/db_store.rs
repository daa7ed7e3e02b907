//! Database-mode `ChannelStore` backend. Write-through: each mutation
//! upserts every channel row and the settings blob inside a single
//! transaction. A polling task (default
//! 1s) watches `MAX(updated_at)` and reloads in full on advancement,
//! matching the donor's `fc-outbox` backends' one-trait-many-tables shape
//! and its interval-driven background task idiom.

use crate::document::GatewayDocument;
use crate::error::{ChannelStoreError, Result};
use crate::mutations::{self, ChannelPatch, UpdateOutcome};
use crate::store::ChannelStore;
use async_trait::async_trait;
use chrono::Utc;
use fc_common::{Channel, PoolKind};
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

pub struct DbChannelStore {
    pool: PgPool,
    state: Arc<RwLock<GatewayDocument>>,
}

impl DbChannelStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Self::init_schema(&pool).await?;
        let mut doc = Self::load_from_db(&pool).await?;
        mutations::run_load_migrations(&mut doc);
        let store = Self {
            pool,
            state: Arc::new(RwLock::new(doc)),
        };
        store.save_to_db().await?;
        Ok(store)
    }

    async fn init_schema(pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id BIGSERIAL PRIMARY KEY,
                channel_id TEXT UNIQUE NOT NULL,
                channel_type TEXT NOT NULL,
                pool_index INTEGER NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                category TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_from_db(pool: &PgPool) -> Result<GatewayDocument> {
        let mut doc = GatewayDocument::default();

        let rows = sqlx::query("SELECT channel_type, data FROM channels ORDER BY channel_type, pool_index")
            .fetch_all(pool)
            .await?;
        for row in rows {
            let channel_type: String = row.get("channel_type");
            let data: serde_json::Value = row.get("data");
            let channel: Channel = serde_json::from_value(data)?;
            let kind = match channel_type.as_str() {
                "messages" => PoolKind::Messages,
                "responses" => PoolKind::Responses,
                "gemini" => PoolKind::Gemini,
                other => {
                    tracing::warn!(other, "unknown channel_type in database row, skipping");
                    continue;
                }
            };
            doc.pool_mut(kind).channels.push(channel);
        }

        if let Some(row) = sqlx::query("SELECT value FROM settings WHERE key = 'gateway_settings'")
            .fetch_optional(pool)
            .await?
        {
            let value: serde_json::Value = row.get("value");
            if let Some(failover) = value.get("failover") {
                doc.failover = serde_json::from_value(failover.clone())?;
            }
            if let Some(debug_log) = value.get("debug_log") {
                doc.debug_log = serde_json::from_value(debug_log.clone())?;
            }
            if let Some(user_agent) = value.get("user_agent") {
                doc.user_agent = serde_json::from_value(user_agent.clone())?;
            }
        }

        Ok(doc)
    }

    async fn save_to_db(&self) -> std::result::Result<(), ChannelStoreError> {
        let doc = self.state.read().clone();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM channels").execute(&mut *tx).await?;
        for (kind, pool) in doc.all_pools() {
            for (idx, channel) in pool.channels.iter().enumerate() {
                let data = serde_json::to_value(channel)?;
                sqlx::query(
                    "INSERT INTO channels (channel_id, channel_type, pool_index, data, updated_at) \
                     VALUES ($1, $2, $3, $4, now())",
                )
                .bind(&channel.id)
                .bind(kind.as_str())
                .bind(idx as i32)
                .bind(data)
                .execute(&mut *tx)
                .await?;
            }
        }

        let settings = serde_json::json!({
            "failover": doc.failover,
            "debug_log": doc.debug_log,
            "user_agent": doc.user_agent,
        });
        sqlx::query(
            "INSERT INTO settings (key, value, category, updated_at) VALUES ('gateway_settings', $1, 'gateway', now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(settings)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut GatewayDocument) -> Result<T>) -> Result<T> {
        let result = {
            let mut doc = self.state.write();
            f(&mut doc)?
        };
        self.save_to_db().await?;
        Ok(result)
    }

    /// Spawns the polling reload task. Disabled implicitly whenever the
    /// caller never invokes this (file-mode watcher is the counterpart).
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let state = self.state.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut last_seen = self.state.read().updated_at;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sqlx::query(
                            "SELECT GREATEST( \
                                (SELECT MAX(updated_at) FROM channels), \
                                (SELECT MAX(updated_at) FROM settings) \
                            ) AS max_updated",
                        )
                        .fetch_optional(&pool)
                        .await
                        {
                            Ok(Some(row)) => {
                                let max_updated: Option<chrono::DateTime<Utc>> = row.get("max_updated");
                                if max_updated.is_some() && max_updated != last_seen {
                                    match Self::load_from_db(&pool).await {
                                        Ok(mut doc) => {
                                            mutations::run_load_migrations(&mut doc);
                                            doc.updated_at = max_updated;
                                            *state.write() = doc;
                                            last_seen = max_updated;
                                            info!("reloaded channel store from database after sibling write");
                                        }
                                        Err(err) => error!(%err, "failed to reload channel store from database"),
                                    }
                                } else {
                                    debug!("channel store poll: no change");
                                }
                            }
                            Ok(None) => {}
                            Err(err) => error!(%err, "channel store poll query failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

#[async_trait]
impl ChannelStore for DbChannelStore {
    async fn get_all(&self, kind: PoolKind) -> Result<Vec<Channel>> {
        Ok(mutations::get_all(&self.state.read(), kind))
    }

    async fn get_current(&self, kind: PoolKind) -> Result<Channel> {
        mutations::get_current(&self.state.read(), kind)
    }

    async fn add(&self, kind: PoolKind, channel: Channel) -> Result<Channel> {
        self.mutate(|doc| mutations::add(doc, kind, channel)).await
    }

    async fn update(&self, kind: PoolKind, index: usize, patch: ChannelPatch) -> Result<UpdateOutcome> {
        self.mutate(|doc| mutations::update(doc, kind, index, patch)).await
    }

    async fn remove(&self, kind: PoolKind, index: usize) -> Result<Channel> {
        self.mutate(|doc| mutations::remove(doc, kind, index)).await
    }

    async fn set_status(&self, kind: PoolKind, index: usize, status: &str) -> Result<()> {
        self.mutate(|doc| mutations::set_status(doc, kind, index, status)).await
    }

    async fn set_promotion(&self, kind: PoolKind, index: usize, duration_secs: i64) -> Result<()> {
        self.mutate(|doc| mutations::set_promotion(doc, kind, index, duration_secs)).await
    }

    async fn reorder(&self, kind: PoolKind, index_list: &[usize]) -> Result<()> {
        self.mutate(|doc| mutations::reorder(doc, kind, index_list)).await
    }

    async fn add_api_key(&self, kind: PoolKind, index: usize, key: String) -> Result<()> {
        self.mutate(|doc| mutations::add_api_key(doc, kind, index, key)).await
    }

    async fn remove_api_key_by_index(&self, kind: PoolKind, index: usize, key_index: usize) -> Result<()> {
        self.mutate(|doc| mutations::remove_api_key_by_index(doc, kind, index, key_index)).await
    }

    async fn move_api_key_top_by_index(&self, kind: PoolKind, index: usize, key_index: usize) -> Result<()> {
        self.mutate(|doc| mutations::move_api_key_top_by_index(doc, kind, index, key_index)).await
    }

    async fn move_api_key_bottom_by_index(&self, kind: PoolKind, index: usize, key_index: usize) -> Result<()> {
        self.mutate(|doc| mutations::move_api_key_bottom_by_index(doc, kind, index, key_index)).await
    }

    async fn deprioritize_api_key(&self, key: &str) -> Result<()> {
        self.mutate(|doc| {
            mutations::deprioritize_api_key(doc, key);
            Ok(())
        })
        .await
    }

    async fn snapshot(&self) -> Result<GatewayDocument> {
        Ok(self.state.read().clone())
    }

    async fn set_debug_log_settings(&self, settings: crate::document::DebugLogSettings) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_debug_log_settings(doc, settings);
            Ok(())
        })
        .await
    }

    async fn set_failover_settings(&self, settings: crate::document::FailoverSettings) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_failover_settings(doc, settings);
            Ok(())
        })
        .await
    }

    async fn set_user_agent_settings(&self, settings: crate::document::UserAgentSettings) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_user_agent_settings(doc, settings);
            Ok(())
        })
        .await
    }

    async fn set_load_balance(&self, kind: PoolKind, strategy: Option<fc_common::LoadBalanceStrategy>) -> Result<()> {
        self.mutate(|doc| {
            mutations::set_load_balance(doc, kind, strategy);
            Ok(())
        })
        .await
    }
}
