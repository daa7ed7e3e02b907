//! The `RequestLogStore` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fc_common::{RequestLog, RequestLogStatus};

use crate::debug_log::DebugLogEntry;
use crate::error::Result;
use crate::sse::LogEventBroadcaster;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RequestLogFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub endpoint: Option<String>,
    pub status: Option<RequestLogStatus>,
    pub channel_name: Option<String>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

impl RequestLogFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct HistoryBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
    pub p50_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, serde::Serialize, utoipa::ToSchema)]
pub struct RequestLogStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost: f64,
    pub history: Vec<HistoryBucket>,
}

/// Bucket width chosen from the requested window length.
pub fn bucket_width_for_window(window: chrono::Duration) -> chrono::Duration {
    if window <= chrono::Duration::hours(1) {
        chrono::Duration::minutes(1)
    } else if window <= chrono::Duration::hours(6) {
        chrono::Duration::minutes(5)
    } else if window <= chrono::Duration::hours(24) {
        chrono::Duration::minutes(15)
    } else if window <= chrono::Duration::days(7) {
        chrono::Duration::hours(1)
    } else {
        chrono::Duration::hours(4)
    }
}

/// Statuses that never count toward the business totals in [`RequestLogStats`].
pub fn excluded_from_totals(status: RequestLogStatus) -> bool {
    matches!(status, RequestLogStatus::Pending | RequestLogStatus::Timeout | RequestLogStatus::Failover)
}

#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn add(&self, log: RequestLog) -> Result<RequestLog>;
    async fn update(&self, id: &str, log: RequestLog) -> Result<()>;
    async fn get_recent(&self, filter: RequestLogFilter) -> Result<Vec<RequestLog>>;
    async fn get_stats(&self, filter: RequestLogFilter) -> Result<RequestLogStats>;
    async fn cleanup(&self, older_than_days: u32) -> Result<u64>;
    async fn cleanup_stale_pending(&self, older_than_seconds: u64) -> Result<u64>;

    async fn record_debug_log(&self, entry: DebugLogEntry) -> Result<()>;
    async fn get_debug_log(&self, request_id: &str) -> Result<Option<DebugLogEntry>>;

    /// The SSE fan-out for this store's write events, shared across the
    /// admin surface's `/v1/admin/request-logs/stream` subscribers.
    fn broadcaster(&self) -> &Arc<LogEventBroadcaster>;
}
