//! The S3 outbound call, abstracted behind a trait the way the donor splits
//! `fc-router::mediator::Mediator` from its `HttpMediator` implementation —
//! the state machine in [`crate::dispatch`] never touches `reqwest`
//! directly, so it can be driven by a fake in tests.

use async_trait::async_trait;
use bytes::Bytes;
use fc_common::Channel;

/// One forwarded request, already stripped of the pool-level routing
/// concerns S0-S2 resolved; everything here is what actually goes over the
/// wire.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: reqwest::Method,
    /// Path + query, appended to the channel's `base_url`.
    pub path: String,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
    pub model: String,
    pub endpoint: String,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub enum UpstreamCallError {
    Timeout,
    Transport(String),
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamCallError::Timeout => write!(f, "upstream call timed out"),
            UpstreamCallError::Transport(e) => write!(f, "upstream transport error: {e}"),
        }
    }
}

/// One attempt against a resolved `(channel, key, model)`. Implementations
/// own authentication header shaping per `serviceType`; the scheduler only
/// knows about retrying and failing over.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(
        &self,
        channel: &Channel,
        key: &str,
        request: &DispatchRequest,
    ) -> Result<UpstreamResponse, UpstreamCallError>;
}

/// `reqwest`-backed passthrough: rewrites only the authentication header (or,
/// for Gemini, the URL's `key` query parameter) for the channel's
/// `serviceType`, forwards method/path/body unchanged otherwise.
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn call(
        &self,
        channel: &Channel,
        key: &str,
        request: &DispatchRequest,
    ) -> Result<UpstreamResponse, UpstreamCallError> {
        let mut url = format!("{}{}", channel.base_url.trim_end_matches('/'), request.path);
        let mut headers = request.headers.clone();
        apply_auth(&mut headers, &mut url, channel, key);

        let built = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .build()
            .map_err(|e| UpstreamCallError::Transport(e.to_string()))?;

        match self.client.execute(built).await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let body = response.bytes().await.map_err(|e| UpstreamCallError::Transport(e.to_string()))?;
                Ok(UpstreamResponse { status, headers, body })
            }
            Err(e) if e.is_timeout() => Err(UpstreamCallError::Timeout),
            Err(e) => Err(UpstreamCallError::Transport(e.to_string())),
        }
    }
}

/// Rewrites the auth header and/or URL for `channel.service_type`. Gemini
/// authenticates via a `key` query parameter rather than a header, so `url`
/// is mutated in place; every other provider only touches `headers`.
fn apply_auth(headers: &mut reqwest::header::HeaderMap, url: &mut String, channel: &Channel, key: &str) {
    use fc_common::ServiceType;
    use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};

    headers.remove(AUTHORIZATION);
    headers.remove("x-api-key");

    match channel.service_type {
        ServiceType::Claude => {
            if let Ok(v) = HeaderValue::from_str(key) {
                headers.insert(HeaderName::from_static("x-api-key"), v);
            }
        }
        ServiceType::OpenaiOauth => {
            if let Some(token) = channel.oauth_tokens.as_ref().and_then(|t| t.access_token.as_deref()) {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, v);
                }
            }
        }
        ServiceType::Gemini => {
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str("key=");
            url.push_str(key);
        }
        _ => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::{ChannelStatus, ServiceType};

    fn channel_of(service_type: ServiceType) -> Channel {
        Channel {
            id: "c1".into(),
            index: Some(0),
            name: "c1".into(),
            service_type,
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

    #[test]
    fn gemini_auth_is_a_query_param_not_a_header() {
        let channel = channel_of(ServiceType::Gemini);
        let mut headers = reqwest::header::HeaderMap::new();
        let mut url = "https://example.test/v1beta/models/gemini-1.5-pro:generateContent".to_string();
        apply_auth(&mut headers, &mut url, &channel, "gem-key");
        assert!(!headers.contains_key(reqwest::header::AUTHORIZATION));
        assert_eq!(url, "https://example.test/v1beta/models/gemini-1.5-pro:generateContent?key=gem-key");
    }

    #[test]
    fn gemini_auth_appends_with_ampersand_when_query_exists() {
        let channel = channel_of(ServiceType::Gemini);
        let mut headers = reqwest::header::HeaderMap::new();
        let mut url = "https://example.test/v1beta/models/gemini-1.5-pro:generateContent?alt=sse".to_string();
        apply_auth(&mut headers, &mut url, &channel, "gem-key");
        assert_eq!(url, "https://example.test/v1beta/models/gemini-1.5-pro:generateContent?alt=sse&key=gem-key");
    }

    #[test]
    fn claude_auth_uses_x_api_key_header() {
        let channel = channel_of(ServiceType::Claude);
        let mut headers = reqwest::header::HeaderMap::new();
        let mut url = "https://example.test/v1/messages".to_string();
        apply_auth(&mut headers, &mut url, &channel, "sk-ant");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(url, "https://example.test/v1/messages");
    }
}
