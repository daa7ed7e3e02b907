//! The three client-facing forwarding routes. Each handler builds a
//! [`DispatchRequest`] from the inbound axum request and hands it to the
//! scheduler; the upstream status/headers/body come back unchanged up to
//! whatever the (currently passthrough) [`Converter`] rewrites.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use fc_common::PoolKind;
use fc_scheduler::DispatchRequest;
use tokio::sync::oneshot;

use crate::converter::converter_for;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::user_agent;

fn required_model(body: &[u8]) -> Result<String, ApiError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| fc_common::GatewayError::InvalidInput(format!("request body is not valid JSON: {e}")))?;
    value
        .get("model")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| fc_common::GatewayError::InvalidInput("request body missing \"model\"".to_string()).into())
}

fn client_id(headers: &HeaderMap) -> Option<String> {
    headers.get("x-client-id").and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn session_id(headers: &HeaderMap) -> Option<String> {
    headers.get("x-session-id").and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[utoipa::path(post, path = "/v1/messages", tag = "ingress",
    responses((status = 200, description = "Upstream response, forwarded verbatim")))]
pub async fn messages(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let model = required_model(&body)?;
    let client_id = client_id(&headers);
    let session_id = session_id(&headers);

    let default_ua = state.user_agent_defaults.messages_default.clone();
    let client_ua = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok());
    let resolved_ua = user_agent::resolve(&state.channels, PoolKind::Messages, client_ua, &default_ua).await;

    let mut out_headers = headers;
    if let Ok(v) = axum::http::HeaderValue::from_str(&resolved_ua) {
        out_headers.insert(axum::http::header::USER_AGENT, v);
    }

    let converter = converter_for(fc_common::ServiceType::Claude);
    let body = converter.build_upstream_request(body).await;

    let request = DispatchRequest {
        method: reqwest::Method::POST,
        path: "/v1/messages".to_string(),
        headers: out_headers,
        body,
        model,
        endpoint: "/v1/messages".to_string(),
        client_id,
        session_id,
    };

    dispatch_and_respond(&state, PoolKind::Messages, request, converter).await
}

#[utoipa::path(post, path = "/v1/responses", tag = "ingress",
    responses((status = 200, description = "Upstream response, forwarded verbatim")))]
pub async fn responses(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Response> {
    let model = required_model(&body)?;
    let client_id = client_id(&headers);
    let session_id = session_id(&headers);

    let default_ua = state.user_agent_defaults.responses_default.clone();
    let client_ua = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok());
    let resolved_ua = user_agent::resolve(&state.channels, PoolKind::Responses, client_ua, &default_ua).await;

    let mut out_headers = headers;
    if let Ok(v) = axum::http::HeaderValue::from_str(&resolved_ua) {
        out_headers.insert(axum::http::header::USER_AGENT, v);
    }

    let converter = converter_for(fc_common::ServiceType::Openai);
    let body = converter.build_upstream_request(body).await;

    let request = DispatchRequest {
        method: reqwest::Method::POST,
        path: "/v1/responses".to_string(),
        headers: out_headers,
        body,
        model,
        endpoint: "/v1/responses".to_string(),
        client_id,
        session_id,
    };

    dispatch_and_respond(&state, PoolKind::Responses, request, converter).await
}

/// `{model}:{action}` arrives as one opaque path segment (the colon is not a
/// routing separator); split it back apart here.
#[utoipa::path(post, path = "/v1/gemini/models/{model_action}", tag = "ingress",
    params(("model_action" = String, Path, description = "\"{model}:{action}\", e.g. gemini-1.5-pro:generateContent")),
    responses((status = 200, description = "Upstream response, forwarded verbatim")))]
pub async fn gemini(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let (model, action) = model_action
        .split_once(':')
        .ok_or_else(|| fc_common::GatewayError::InvalidInput("expected \"{model}:{action}\" path segment".to_string()))?;

    let retained_query: Vec<(String, String)> = query
        .into_iter()
        .filter(|(k, _)| !matches!(k.as_str(), "key" | "api_key" | "apiKey"))
        .collect();
    let query_string = if retained_query.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = retained_query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("?{}", parts.join("&"))
    };

    let path = format!("/v1beta/models/{model}:{action}{query_string}");
    let endpoint = format!("/v1/gemini/models/{model}:{action}");
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| fc_common::GatewayError::InvalidInput("unsupported HTTP method".to_string()))?;

    let request_client_id = client_id(&headers);
    let request_session_id = session_id(&headers);

    let converter = converter_for(fc_common::ServiceType::Gemini);
    let out_body = converter.build_upstream_request(body).await;

    let request = DispatchRequest {
        method: reqwest_method,
        path,
        headers,
        body: out_body,
        model: model.to_string(),
        endpoint,
        client_id: request_client_id,
        session_id: request_session_id,
    };

    dispatch_and_respond(&state, PoolKind::Gemini, request, converter).await
}

async fn dispatch_and_respond(
    state: &AppState,
    pool: PoolKind,
    request: DispatchRequest,
    converter: &dyn crate::converter::Converter,
) -> ApiResult<Response> {
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let response = state.scheduler.dispatch(pool, request, cancel_rx).await?;

    let body = converter.parse_response(response.body).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, response.headers, body).into_response())
}
