//! Maps [`fc_common::GatewayError`] onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fc_common::GatewayError;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            GatewayError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            GatewayError::NoChannels | GatewayError::NoKeys | GatewayError::AllKeysUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_upstream_available")
            }
            GatewayError::UpstreamHttp { status, .. } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                (status, "upstream_http")
            }
            GatewayError::UpstreamTransport(_) => (StatusCode::BAD_GATEWAY, "upstream_transport"),
            GatewayError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            GatewayError::ClientCanceled => (StatusCode::from_u16(499).unwrap(), "client_canceled"),
            GatewayError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = if let GatewayError::UpstreamHttp { body, .. } = &self.0 {
            ErrorBody { error: kind.to_string(), message: body.clone() }
        } else {
            ErrorBody { error: kind.to_string(), message: self.0.to_string() }
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
