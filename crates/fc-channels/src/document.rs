//! The persisted channel-store document.
//!
//! Both backends (file and database) converge on this in-memory shape; only
//! the save/load path differs.

use chrono::{DateTime, Utc};
use fc_common::{Channel, FailoverRule, LoadBalanceStrategy, PoolKind};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DebugLogSettings {
    pub enabled: bool,
    pub retention_hours: u64,
    pub max_body_size: usize,
}

impl Default for DebugLogSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_hours: 24,
            max_body_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailoverSettings {
    pub enabled: bool,
    pub rules: Vec<FailoverRule>,
    pub generic_resource_wait_seconds: u64,
    pub model_cooldown_extra_seconds: u64,
    pub model_cooldown_max_wait_seconds: u64,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            generic_resource_wait_seconds: 20,
            model_cooldown_extra_seconds: 1,
            model_cooldown_max_wait_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, ToSchema)]
pub struct CapturedUserAgent {
    pub latest: Option<String>,
    pub last_captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, ToSchema)]
pub struct UserAgentSettings {
    pub messages: CapturedUserAgent,
    pub responses: CapturedUserAgent,
}

/// One ordered pool plus its default load-balance strategy.
#[derive(Debug, Clone, Serialize, Deserialize, Default, ToSchema)]
pub struct Pool {
    pub channels: Vec<Channel>,
    pub load_balance: Option<LoadBalanceStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayDocument {
    #[serde(rename = "upstream")]
    pub messages: Pool,
    #[serde(rename = "responsesUpstream", alias = "responses")]
    pub responses: Pool,
    #[serde(rename = "geminiUpstream", alias = "gemini")]
    pub gemini: Pool,
    #[serde(default)]
    pub debug_log: DebugLogSettings,
    #[serde(default)]
    pub failover: FailoverSettings,
    #[serde(default)]
    pub user_agent: UserAgentSettings,
    /// Bumped on every mutation; DB-mode polling compares this (and per-row
    /// `updated_at`) to detect sibling-instance writes.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for GatewayDocument {
    fn default() -> Self {
        Self {
            messages: Pool::default(),
            responses: Pool::default(),
            gemini: Pool::default(),
            debug_log: DebugLogSettings::default(),
            failover: FailoverSettings::default(),
            user_agent: UserAgentSettings::default(),
            updated_at: None,
        }
    }
}

impl GatewayDocument {
    pub fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Messages => &self.messages,
            PoolKind::Responses => &self.responses,
            PoolKind::Gemini => &self.gemini,
        }
    }

    pub fn pool_mut(&mut self, kind: PoolKind) -> &mut Pool {
        match kind {
            PoolKind::Messages => &mut self.messages,
            PoolKind::Responses => &mut self.responses,
            PoolKind::Gemini => &mut self.gemini,
        }
    }

    pub fn all_pools(&self) -> [(PoolKind, &Pool); 3] {
        [
            (PoolKind::Messages, &self.messages),
            (PoolKind::Responses, &self.responses),
            (PoolKind::Gemini, &self.gemini),
        ]
    }

    /// Name uniqueness is case-insensitive, trimmed, across *all three* pools (invariant i).
    pub fn name_in_use(&self, name: &str, except: Option<(PoolKind, usize)>) -> bool {
        let normalized = name.trim().to_ascii_lowercase();
        for (kind, pool) in self.all_pools() {
            for (idx, channel) in pool.channels.iter().enumerate() {
                if except == Some((kind, idx)) {
                    continue;
                }
                if channel.normalized_name() == normalized {
                    return true;
                }
            }
        }
        false
    }

    pub fn find_by_id(&self, id: &str) -> Option<(PoolKind, usize)> {
        for (kind, pool) in self.all_pools() {
            if let Some(idx) = pool.channels.iter().position(|c| c.id == id) {
                return Some((kind, idx));
            }
        }
        None
    }
}
