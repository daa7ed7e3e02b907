//! Router assembly and OpenAPI documentation, mirroring the donor's
//! `fc-router::api::mod`: one `ApiDoc` struct enumerating every handler and
//! schema, merged with a Swagger UI, then handed back to `main` for the
//! tracing/CORS layers and `axum::serve`.

use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::AppState;
use crate::{admin, ingress};

#[derive(OpenApi)]
#[openapi(
    info(title = "fc-server", description = "LLM gateway: ingress routing, failover, and channel administration"),
    paths(
        ingress::messages,
        ingress::responses,
        ingress::gemini,
        admin::list_channels,
        admin::add_channel,
        admin::update_channel,
        admin::remove_channel,
        admin::set_status,
        admin::set_promotion,
        admin::reorder,
        admin::set_load_balance,
        admin::add_api_key,
        admin::remove_api_key,
        admin::move_api_key_top,
        admin::move_api_key_bottom,
        admin::get_failover_config,
        admin::update_failover_config,
        admin::get_debug_log_config,
        admin::update_debug_log_config,
        admin::get_user_agent_config,
        admin::update_user_agent_config,
        admin::list_request_logs,
        admin::request_log_stats,
        admin::get_debug_log,
    ),
    components(schemas(
        fc_common::Channel,
        fc_common::ChannelStatus,
        fc_common::ServiceType,
        fc_common::Quota,
        fc_common::OauthTokens,
        fc_common::ContentFilter,
        fc_common::CompositeMapping,
        fc_common::LoadBalanceStrategy,
        fc_common::FailoverRule,
        fc_common::FailoverAction,
        fc_common::ActionStep,
        fc_common::RequestLog,
        fc_common::RequestLogStatus,
        fc_channels::document::DebugLogSettings,
        fc_channels::document::FailoverSettings,
        fc_channels::document::UserAgentSettings,
        fc_channels::document::CapturedUserAgent,
        fc_requestlog::DebugLogEntry,
        fc_requestlog::RequestLogStats,
        fc_requestlog::HistoryBucket,
        crate::error::ErrorBody,
        admin::ChannelPatchBody,
        admin::SetStatusBody,
        admin::SetPromotionBody,
        admin::SetLoadBalanceBody,
        admin::AddApiKeyBody,
        admin::UpdateOutcomeBody,
    )),
    tags(
        (name = "ingress", description = "Client-facing forwarding routes"),
        (name = "admin", description = "Channel, key, and settings administration"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let channel_routes = Router::new()
        .route("/v1/admin/:pool/channels", get(admin::list_channels).post(admin::add_channel))
        .route("/v1/admin/:pool/channels/:index", patch(admin::update_channel).delete(admin::remove_channel))
        .route("/v1/admin/:pool/channels/:index/status", put(admin::set_status))
        .route("/v1/admin/:pool/channels/:index/promotion", put(admin::set_promotion))
        .route("/v1/admin/:pool/reorder", put(admin::reorder))
        .route("/v1/admin/:pool/load-balance", put(admin::set_load_balance))
        .route("/v1/admin/:pool/channels/:index/keys", post(admin::add_api_key))
        .route("/v1/admin/:pool/channels/:index/keys/:key_index", delete(admin::remove_api_key))
        .route("/v1/admin/:pool/channels/:index/keys/:key_index/top", put(admin::move_api_key_top))
        .route("/v1/admin/:pool/channels/:index/keys/:key_index/bottom", put(admin::move_api_key_bottom));

    let settings_routes = Router::new()
        .route("/v1/admin/failover", get(admin::get_failover_config).put(admin::update_failover_config))
        .route("/v1/admin/debug-log", get(admin::get_debug_log_config).put(admin::update_debug_log_config))
        .route("/v1/admin/user-agent", get(admin::get_user_agent_config).put(admin::update_user_agent_config));

    let request_log_routes = Router::new()
        .route("/v1/admin/request-logs", get(admin::list_request_logs))
        .route("/v1/admin/request-logs/stats", get(admin::request_log_stats))
        .route("/v1/admin/request-logs/stream", get(admin::stream_request_logs))
        .route("/v1/admin/request-logs/:request_id/debug", get(admin::get_debug_log));

    let ingress_routes = Router::new()
        .route("/v1/messages", post(ingress::messages))
        .route("/v1/responses", post(ingress::responses))
        .route("/v1/gemini/models/:model_action", get(ingress::gemini).post(ingress::gemini));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(ingress_routes)
        .merge(channel_routes)
        .merge(settings_routes)
        .merge(request_log_routes)
        .with_state(state)
}
