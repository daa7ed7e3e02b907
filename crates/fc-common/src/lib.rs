use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use utoipa::ToSchema;

pub mod logging;

// ============================================================================
// Pool kind
// ============================================================================

/// One of the three independent ordered channel pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Messages,
    Responses,
    Gemini,
}

impl PoolKind {
    pub const ALL: [PoolKind; 3] = [PoolKind::Messages, PoolKind::Responses, PoolKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Messages => "messages",
            PoolKind::Responses => "responses",
            PoolKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Channel status / service type
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Suspended,
    Disabled,
}

impl ChannelStatus {
    /// Case-insensitive normalization, matching the store's `SetStatus` contract.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Some(ChannelStatus::Active),
            "suspended" => Some(ChannelStatus::Suspended),
            "disabled" => Some(ChannelStatus::Disabled),
            _ => None,
        }
    }

    pub fn is_dispatch_eligible(&self) -> bool {
        matches!(self, ChannelStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Claude,
    Openai,
    OpenaiChat,
    Openaiold,
    Gemini,
    #[serde(rename = "openai-oauth")]
    OpenaiOauth,
    Composite,
}

impl ServiceType {
    pub fn is_composite(&self) -> bool {
        matches!(self, ServiceType::Composite)
    }
}

// ============================================================================
// Quota / model mapping / price multipliers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    #[serde(rename = "type")]
    pub quota_type: String,
    pub limit: f64,
    pub reset_at: Option<DateTime<Utc>>,
    pub reset_interval: Option<u64>,
    pub reset_unit: Option<String>,
    pub mode: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct OauthTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContentFilter {
    pub blocked_patterns: Vec<String>,
}

/// Routes requests for one of the three model families to a concrete channel.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompositeMapping {
    /// The pattern matched against the requested model (e.g. "haiku", "sonnet", "opus").
    pub pattern: String,
    /// Preferred reference: the stable channel UID.
    pub target_channel_id: Option<String>,
    /// Legacy reference: an index into the same pool, rewritten to an ID on load.
    pub target_channel: Option<usize>,
    /// Overrides the forwarded model name when set.
    pub target_model: Option<String>,
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Stable 8 hex char identifier, assigned once, never reused.
    pub id: String,
    /// Transient position in the current ordered list. Not persisted as truth;
    /// recomputed on every read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub name: String,
    pub service_type: ServiceType,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub oauth_tokens: Option<OauthTokens>,
    /// Source model prefix -> target model. Longest prefix wins on lookup.
    #[serde(default)]
    pub model_mapping: std::collections::BTreeMap<String, String>,
    /// 1-based; 0 means "use index order".
    #[serde(default)]
    pub priority: u32,
    pub status: ChannelStatus,
    pub promotion_until: Option<DateTime<Utc>>,
    pub quota: Option<Quota>,
    pub rate_limit_rpm: Option<u32>,
    pub key_load_balance: Option<LoadBalanceStrategy>,
    pub content_filter: Option<ContentFilter>,
    /// Exactly three when present: one each for haiku/sonnet/opus.
    pub composite_mappings: Option<Vec<CompositeMapping>>,
    #[serde(default)]
    pub price_multipliers: std::collections::BTreeMap<String, f64>,
}

impl Channel {
    pub fn has_usable_credential(&self) -> bool {
        if self.service_type.is_composite() {
            return true;
        }
        if self.service_type == ServiceType::OpenaiOauth {
            return self
                .oauth_tokens
                .as_ref()
                .map(|t| t.access_token.is_some())
                .unwrap_or(false);
        }
        !self.api_keys.is_empty()
    }

    pub fn normalized_name(&self) -> String {
        self.name.trim().to_ascii_lowercase()
    }
}

// ============================================================================
// Failover rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailoverAction {
    Retry,
    Failover,
    Suspend,
    ReturnError,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionStep {
    pub action: FailoverAction,
    /// 0 means "use the parsed hint from the response".
    pub wait_seconds: u64,
    /// 99 is treated as effectively unbounded.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailoverRule {
    /// Comma-separated `STATUS` / `STATUS:SUBTYPE` patterns, or the literal "others".
    pub error_codes: String,
    pub action_chain: Vec<ActionStep>,
}

impl FailoverRule {
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.error_codes.split(',').map(|s| s.trim()).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    Failover,
    RoundRobin,
    Random,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        LoadBalanceStrategy::Failover
    }
}

// ============================================================================
// Parsed upstream error / decision
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ParsedError {
    pub status_code: u16,
    /// Provider-agnostic tag: QUOTA_EXHAUSTED / model_cooldown / RESOURCE_EXHAUSTED /
    /// CREDIT_EXHAUSTED / empty.
    pub subtype: String,
    pub wait_duration_secs: u64,
    pub reset_seconds: Option<f64>,
}

impl ParsedError {
    /// `"STATUS:SUBTYPE"` when a subtype is present, else `"STATUS"`.
    pub fn error_code_pattern(&self) -> String {
        if self.subtype.is_empty() {
            self.status_code.to_string()
        } else {
            format!("{}:{}", self.status_code, self.subtype)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Retry {
        wait_secs: u64,
        mark_key_failed: bool,
    },
    FailoverKey {
        mark_key_failed: bool,
        deprioritize_key: bool,
    },
    SuspendChannel {
        reason: String,
    },
    None {
        reason: String,
    },
}

// ============================================================================
// Request log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestLogStatus {
    Pending,
    Completed,
    Error,
    Timeout,
    Failover,
    RetryWait,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub id: String,
    pub status: RequestLogStatus,
    pub initial_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_creation_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub input_cost: Option<f64>,
    pub output_cost: Option<f64>,
    pub total_cost: Option<f64>,
    pub channel_id: Option<usize>,
    pub channel_uid: Option<String>,
    pub channel_name: Option<String>,
    pub endpoint: String,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    /// nil = unset, Some(0) = master key.
    pub api_key_id: Option<i64>,
    pub failover_info: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// Error kinds
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no channels available")]
    NoChannels,

    #[error("no keys available")]
    NoKeys,

    #[error("all keys unavailable")]
    AllKeysUnavailable,

    #[error("upstream returned {status} ({subtype})")]
    UpstreamHttp { status: u16, subtype: String, body: String },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("request timed out")]
    Timeout,

    #[error("client canceled the request")]
    ClientCanceled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Generates a stable 8 hex char channel id, matching the store's `id` contract.
pub fn generate_channel_id() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}

/// Generates a request log id in the `req_<nanos>` shape.
pub fn generate_request_log_id() -> String {
    format!("req_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_is_eight_hex_chars() {
        let id = generate_channel_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!(ChannelStatus::parse(" Active "), Some(ChannelStatus::Active));
        assert_eq!(ChannelStatus::parse("SUSPENDED"), Some(ChannelStatus::Suspended));
        assert_eq!(ChannelStatus::parse("bogus"), None);
    }

    #[test]
    fn error_code_pattern_includes_subtype_only_when_present() {
        let with_subtype = ParsedError {
            status_code: 429,
            subtype: "QUOTA_EXHAUSTED".to_string(),
            wait_duration_secs: 0,
            reset_seconds: None,
        };
        assert_eq!(with_subtype.error_code_pattern(), "429:QUOTA_EXHAUSTED");

        let without_subtype = ParsedError {
            status_code: 500,
            subtype: String::new(),
            wait_duration_secs: 0,
            reset_seconds: None,
        };
        assert_eq!(without_subtype.error_code_pattern(), "500");
    }
}
