//! Admin surface: channel/key CRUD and reordering, failover,
//! debug-log, user-agent, and load-balance settings, plus request-log query
//! and SSE streaming. Every handler goes through `ChannelStore` or
//! `RequestLogStore` directly; there is no separate admin-layer cache.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fc_channels::document::{DebugLogSettings, FailoverSettings, UserAgentSettings};
use fc_channels::ChannelPatch;
use fc_common::{Channel, GatewayError, LoadBalanceStrategy, PoolKind};
use fc_requestlog::{RequestLogFilter, RequestLogStats};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn parse_pool(raw: &str) -> ApiResult<PoolKind> {
    match raw {
        "messages" => Ok(PoolKind::Messages),
        "responses" => Ok(PoolKind::Responses),
        "gemini" => Ok(PoolKind::Gemini),
        other => Err(GatewayError::InvalidInput(format!("unknown pool '{other}'")).into()),
    }
}

// ============================================================================
// Channel CRUD
// ============================================================================

#[utoipa::path(get, path = "/v1/admin/{pool}/channels", tag = "admin",
    responses((status = 200, description = "Channels in a pool, in priority order", body = Vec<Channel>)))]
pub async fn list_channels(State(state): State<AppState>, Path(pool): Path<String>) -> ApiResult<Json<Vec<Channel>>> {
    let kind = parse_pool(&pool)?;
    Ok(Json(state.channels.get_all(kind).await?))
}

#[utoipa::path(post, path = "/v1/admin/{pool}/channels", tag = "admin",
    request_body = Channel,
    responses((status = 201, description = "Channel added", body = Channel)))]
pub async fn add_channel(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Json(channel): Json<Channel>,
) -> ApiResult<Json<Channel>> {
    let kind = parse_pool(&pool)?;
    Ok(Json(state.channels.add(kind, channel).await?))
}

#[utoipa::path(patch, path = "/v1/admin/{pool}/channels/{index}", tag = "admin",
    request_body = ChannelPatchBody,
    responses((status = 200, description = "Channel updated")))]
pub async fn update_channel(
    State(state): State<AppState>,
    Path((pool, index)): Path<(String, usize)>,
    Json(patch): Json<ChannelPatchBody>,
) -> ApiResult<Json<UpdateOutcomeBody>> {
    let kind = parse_pool(&pool)?;
    let outcome = state.channels.update(kind, index, patch.into()).await?;
    Ok(Json(UpdateOutcomeBody { should_reset_metrics: outcome.should_reset_metrics }))
}

#[utoipa::path(delete, path = "/v1/admin/{pool}/channels/{index}", tag = "admin",
    responses((status = 200, description = "Channel removed", body = Channel)))]
pub async fn remove_channel(
    State(state): State<AppState>,
    Path((pool, index)): Path<(String, usize)>,
) -> ApiResult<Json<Channel>> {
    let kind = parse_pool(&pool)?;
    Ok(Json(state.channels.remove(kind, index).await?))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetStatusBody {
    pub status: String,
}

#[utoipa::path(put, path = "/v1/admin/{pool}/channels/{index}/status", tag = "admin",
    request_body = SetStatusBody, responses((status = 200, description = "Status updated")))]
pub async fn set_status(
    State(state): State<AppState>,
    Path((pool, index)): Path<(String, usize)>,
    Json(body): Json<SetStatusBody>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.set_status(kind, index, &body.status).await?;
    Ok(())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetPromotionBody {
    pub duration_secs: i64,
}

#[utoipa::path(put, path = "/v1/admin/{pool}/channels/{index}/promotion", tag = "admin",
    request_body = SetPromotionBody, responses((status = 200, description = "Promotion updated")))]
pub async fn set_promotion(
    State(state): State<AppState>,
    Path((pool, index)): Path<(String, usize)>,
    Json(body): Json<SetPromotionBody>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.set_promotion(kind, index, body.duration_secs).await?;
    Ok(())
}

#[utoipa::path(put, path = "/v1/admin/{pool}/reorder", tag = "admin",
    request_body = Vec<usize>, responses((status = 200, description = "Pool reordered")))]
pub async fn reorder(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Json(index_list): Json<Vec<usize>>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.reorder(kind, &index_list).await?;
    Ok(())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetLoadBalanceBody {
    pub strategy: Option<LoadBalanceStrategy>,
}

#[utoipa::path(put, path = "/v1/admin/{pool}/load-balance", tag = "admin",
    request_body = SetLoadBalanceBody, responses((status = 200, description = "Pool default strategy updated")))]
pub async fn set_load_balance(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Json(body): Json<SetLoadBalanceBody>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.set_load_balance(kind, body.strategy).await?;
    Ok(())
}

// ============================================================================
// API key CRUD / reorder
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddApiKeyBody {
    pub key: String,
}

#[utoipa::path(post, path = "/v1/admin/{pool}/channels/{index}/keys", tag = "admin",
    request_body = AddApiKeyBody, responses((status = 201, description = "Key added")))]
pub async fn add_api_key(
    State(state): State<AppState>,
    Path((pool, index)): Path<(String, usize)>,
    Json(body): Json<AddApiKeyBody>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.add_api_key(kind, index, body.key).await?;
    Ok(())
}

#[utoipa::path(delete, path = "/v1/admin/{pool}/channels/{index}/keys/{key_index}", tag = "admin",
    responses((status = 200, description = "Key removed")))]
pub async fn remove_api_key(
    State(state): State<AppState>,
    Path((pool, index, key_index)): Path<(String, usize, usize)>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.remove_api_key_by_index(kind, index, key_index).await?;
    Ok(())
}

#[utoipa::path(put, path = "/v1/admin/{pool}/channels/{index}/keys/{key_index}/top", tag = "admin",
    responses((status = 200, description = "Key moved to top")))]
pub async fn move_api_key_top(
    State(state): State<AppState>,
    Path((pool, index, key_index)): Path<(String, usize, usize)>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.move_api_key_top_by_index(kind, index, key_index).await?;
    Ok(())
}

#[utoipa::path(put, path = "/v1/admin/{pool}/channels/{index}/keys/{key_index}/bottom", tag = "admin",
    responses((status = 200, description = "Key moved to bottom")))]
pub async fn move_api_key_bottom(
    State(state): State<AppState>,
    Path((pool, index, key_index)): Path<(String, usize, usize)>,
) -> ApiResult<()> {
    let kind = parse_pool(&pool)?;
    state.channels.move_api_key_bottom_by_index(kind, index, key_index).await?;
    Ok(())
}

// ============================================================================
// Failover / debug-log / user-agent settings
// ============================================================================

#[utoipa::path(get, path = "/v1/admin/failover", tag = "admin",
    responses((status = 200, description = "Current failover configuration", body = FailoverSettings)))]
pub async fn get_failover_config(State(state): State<AppState>) -> ApiResult<Json<FailoverSettings>> {
    let snapshot = state.channels.snapshot().await?;
    Ok(Json(snapshot.failover))
}

#[utoipa::path(put, path = "/v1/admin/failover", tag = "admin",
    request_body = FailoverSettings, responses((status = 200, description = "Failover configuration updated")))]
pub async fn update_failover_config(State(state): State<AppState>, Json(settings): Json<FailoverSettings>) -> ApiResult<()> {
    state.failover.set_rules(settings.rules.clone());
    state.channels.set_failover_settings(settings).await?;
    Ok(())
}

#[utoipa::path(get, path = "/v1/admin/debug-log", tag = "admin",
    responses((status = 200, description = "Current debug-log configuration", body = DebugLogSettings)))]
pub async fn get_debug_log_config(State(state): State<AppState>) -> ApiResult<Json<DebugLogSettings>> {
    let snapshot = state.channels.snapshot().await?;
    Ok(Json(snapshot.debug_log))
}

#[utoipa::path(put, path = "/v1/admin/debug-log", tag = "admin",
    request_body = DebugLogSettings, responses((status = 200, description = "Debug-log configuration updated")))]
pub async fn update_debug_log_config(State(state): State<AppState>, Json(settings): Json<DebugLogSettings>) -> ApiResult<()> {
    state.channels.set_debug_log_settings(settings).await?;
    Ok(())
}

#[utoipa::path(get, path = "/v1/admin/user-agent", tag = "admin",
    responses((status = 200, description = "Captured user-agent state", body = UserAgentSettings)))]
pub async fn get_user_agent_config(State(state): State<AppState>) -> ApiResult<Json<UserAgentSettings>> {
    let snapshot = state.channels.snapshot().await?;
    Ok(Json(snapshot.user_agent))
}

#[utoipa::path(put, path = "/v1/admin/user-agent", tag = "admin",
    request_body = UserAgentSettings, responses((status = 200, description = "User-agent configuration updated")))]
pub async fn update_user_agent_config(State(state): State<AppState>, Json(settings): Json<UserAgentSettings>) -> ApiResult<()> {
    state.channels.set_user_agent_settings(settings).await?;
    Ok(())
}

// ============================================================================
// Request log query / stats / SSE / debug-log retrieval
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RequestLogQuery {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub endpoint: Option<String>,
    pub status: Option<String>,
    pub channel_name: Option<String>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

fn parse_status(raw: &str) -> ApiResult<fc_common::RequestLogStatus> {
    use fc_common::RequestLogStatus::*;
    match raw {
        "pending" => Ok(Pending),
        "completed" => Ok(Completed),
        "error" => Ok(Error),
        "timeout" => Ok(Timeout),
        "failover" => Ok(Failover),
        "retry_wait" => Ok(RetryWait),
        other => Err(GatewayError::InvalidInput(format!("unknown request log status '{other}'")).into()),
    }
}

impl RequestLogQuery {
    fn into_filter(self) -> ApiResult<RequestLogFilter> {
        Ok(RequestLogFilter {
            since: self.since,
            until: self.until,
            endpoint: self.endpoint,
            status: self.status.as_deref().map(parse_status).transpose()?,
            channel_name: self.channel_name,
            client_id: self.client_id,
            session_id: self.session_id,
            limit: self.limit,
        })
    }
}

#[utoipa::path(get, path = "/v1/admin/request-logs", tag = "admin",
    responses((status = 200, description = "Recent request log entries", body = Vec<fc_common::RequestLog>)))]
pub async fn list_request_logs(
    State(state): State<AppState>,
    Query(query): Query<RequestLogQuery>,
) -> ApiResult<Json<Vec<fc_common::RequestLog>>> {
    let filter = query.into_filter()?;
    Ok(Json(state.request_log.get_recent(filter).await?))
}

#[utoipa::path(get, path = "/v1/admin/request-logs/stats", tag = "admin",
    responses((status = 200, description = "Aggregate request log statistics", body = RequestLogStats)))]
pub async fn request_log_stats(
    State(state): State<AppState>,
    Query(query): Query<RequestLogQuery>,
) -> ApiResult<Json<RequestLogStats>> {
    let filter = query.into_filter()?;
    Ok(Json(state.request_log.get_stats(filter).await?))
}

#[utoipa::path(get, path = "/v1/admin/request-logs/{request_id}/debug", tag = "admin",
    responses((status = 200, description = "Captured request/response bodies, gzip-compressed and base64-encoded", body = fc_requestlog::DebugLogEntryView)))]
pub async fn get_debug_log(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<Response> {
    match state.request_log.get_debug_log(&request_id).await? {
        Some(entry) => Ok(Json(entry.into_view()).into_response()),
        None => Err(GatewayError::NotFound(request_id).into()),
    }
}

/// Streams `log:created`/`log:updated` events as Server-Sent Events.
/// `SubscriberCapacityReached` surfaces as a plain 503; the client is
/// expected to back off and retry.
pub async fn stream_request_logs(
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.request_log.broadcaster().subscribe().map_err(|e| GatewayError::Internal(e.to_string()))?;
    let stream = async_stream::stream! {
        let mut rx = subscription.rx;
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                yield Ok(Event::default().data(json));
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Wire bodies
// ============================================================================

/// Mirrors [`ChannelPatch`] field-for-field but as a request body: every
/// field optional, `None` means "leave unchanged".
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPatchBody {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_keys: Option<Vec<String>>,
    pub oauth_tokens: Option<fc_common::OauthTokens>,
    pub model_mapping: Option<std::collections::BTreeMap<String, String>>,
    pub priority: Option<u32>,
    pub status: Option<fc_common::ChannelStatus>,
    pub quota: Option<fc_common::Quota>,
    pub rate_limit_rpm: Option<Option<u32>>,
    pub key_load_balance: Option<Option<LoadBalanceStrategy>>,
    pub content_filter: Option<Option<fc_common::ContentFilter>>,
    pub composite_mappings: Option<Vec<fc_common::CompositeMapping>>,
    pub price_multipliers: Option<std::collections::BTreeMap<String, f64>>,
}

impl From<ChannelPatchBody> for ChannelPatch {
    fn from(body: ChannelPatchBody) -> Self {
        ChannelPatch {
            name: body.name,
            base_url: body.base_url,
            api_keys: body.api_keys,
            oauth_tokens: body.oauth_tokens,
            model_mapping: body.model_mapping,
            priority: body.priority,
            status: body.status,
            quota: body.quota,
            rate_limit_rpm: body.rate_limit_rpm,
            key_load_balance: body.key_load_balance,
            content_filter: body.content_filter,
            composite_mappings: body.composite_mappings,
            price_multipliers: body.price_multipliers,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateOutcomeBody {
    pub should_reset_metrics: bool,
}
