//! The `ChannelStore` trait: the single source of truth for channels.
//! File-mode and database-mode backends both implement it, mirroring the
//! donor's one-trait/many-backends split
//! (`fc-outbox::repository::OutboxRepository` / `SqliteOutboxRepository` /
//! `PostgresOutboxRepository`).

use crate::document::GatewayDocument;
use crate::mutations::{ChannelPatch, UpdateOutcome};
use async_trait::async_trait;
use fc_common::{Channel, PoolKind};

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn get_all(&self, kind: PoolKind) -> crate::error::Result<Vec<Channel>>;
    async fn get_current(&self, kind: PoolKind) -> crate::error::Result<Channel>;
    async fn add(&self, kind: PoolKind, channel: Channel) -> crate::error::Result<Channel>;
    async fn update(
        &self,
        kind: PoolKind,
        index: usize,
        patch: ChannelPatch,
    ) -> crate::error::Result<UpdateOutcome>;
    async fn remove(&self, kind: PoolKind, index: usize) -> crate::error::Result<Channel>;
    async fn set_status(&self, kind: PoolKind, index: usize, status: &str) -> crate::error::Result<()>;
    async fn set_promotion(&self, kind: PoolKind, index: usize, duration_secs: i64) -> crate::error::Result<()>;
    async fn reorder(&self, kind: PoolKind, index_list: &[usize]) -> crate::error::Result<()>;
    async fn add_api_key(&self, kind: PoolKind, index: usize, key: String) -> crate::error::Result<()>;
    async fn remove_api_key_by_index(
        &self,
        kind: PoolKind,
        index: usize,
        key_index: usize,
    ) -> crate::error::Result<()>;
    async fn move_api_key_top_by_index(
        &self,
        kind: PoolKind,
        index: usize,
        key_index: usize,
    ) -> crate::error::Result<()>;
    async fn move_api_key_bottom_by_index(
        &self,
        kind: PoolKind,
        index: usize,
        key_index: usize,
    ) -> crate::error::Result<()>;
    async fn deprioritize_api_key(&self, key: &str) -> crate::error::Result<()>;

    /// Full snapshot of the current document, for composite resolution and
    /// diagnostics.
    async fn snapshot(&self) -> crate::error::Result<GatewayDocument>;

    async fn set_debug_log_settings(&self, settings: crate::document::DebugLogSettings) -> crate::error::Result<()>;
    async fn set_failover_settings(&self, settings: crate::document::FailoverSettings) -> crate::error::Result<()>;
    async fn set_user_agent_settings(&self, settings: crate::document::UserAgentSettings) -> crate::error::Result<()>;
    async fn set_load_balance(
        &self,
        kind: PoolKind,
        strategy: Option<fc_common::LoadBalanceStrategy>,
    ) -> crate::error::Result<()>;
}
