//! Exercises the real `ReqwestUpstream`/`FileChannelStore`/
//! `SqliteRequestLogStore` stack against an actual HTTP server, rather than
//! the hand-rolled fakes `dispatch.rs`'s own unit tests use. Catches anything
//! the fakes can't: header casing, URL assembly, a real non-blocking I/O
//! round trip.

use fc_channels::{CooldownConfig, FileChannelStore, KeyCooldownCache, LoadBalancer};
use fc_common::{Channel, ChannelStatus, PoolKind, ServiceType};
use fc_failover::{ErrorParserConfig, FailoverEngine};
use fc_metrics::MetricsRegistry;
use fc_requestlog::SqliteRequestLogStore;
use fc_scheduler::{DispatchRequest, ReqwestUpstream, Scheduler};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn channel(base_url: String) -> Channel {
    Channel {
        id: String::new(),
        index: None,
        name: "wiremock-channel".to_string(),
        service_type: ServiceType::Claude,
        base_url,
        api_keys: vec!["sk-test-key".to_string()],
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

async fn build_scheduler(base_url: String, dir: &tempfile::TempDir) -> Scheduler {
    let store_path = dir.path().join("channels.json");
    let store = FileChannelStore::open(&store_path, 2).unwrap();
    store.add(PoolKind::Messages, channel(base_url)).await.unwrap();

    let request_log = SqliteRequestLogStore::connect("sqlite::memory:", 10).await.unwrap();
    let cooldown = Arc::new(KeyCooldownCache::new(CooldownConfig::default()));

    Scheduler::new(
        Arc::new(store),
        Arc::new(LoadBalancer::new(cooldown)),
        Arc::new(FailoverEngine::with_default_rules()),
        Arc::new(MetricsRegistry::default()),
        Arc::new(request_log),
        Arc::new(ReqwestUpstream::new(reqwest::Client::new())),
        ErrorParserConfig::default(),
    )
}

fn dispatch_request() -> DispatchRequest {
    DispatchRequest {
        method: reqwest::Method::POST,
        path: "/v1/messages".to_string(),
        headers: reqwest::header::HeaderMap::new(),
        body: bytes::Bytes::from_static(br#"{"model":"claude-3-5-sonnet"}"#),
        model: "claude-3-5-sonnet".to_string(),
        endpoint: "/v1/messages".to_string(),
        client_id: None,
        session_id: None,
    }
}

#[tokio::test]
async fn successful_call_carries_the_channel_api_key_header() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"msg_1"}"#))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let scheduler = build_scheduler(mock_server.uri(), &dir).await;
    let (_tx, rx) = tokio::sync::oneshot::channel();

    let response = scheduler.dispatch(PoolKind::Messages, dispatch_request(), rx).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), br#"{"id":"msg_1"}"#);
}

#[tokio::test]
async fn transient_5xx_is_retried_then_succeeds() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let scheduler = build_scheduler(mock_server.uri(), &dir).await;
    let (_tx, rx) = tokio::sync::oneshot::channel();

    let response = scheduler.dispatch(PoolKind::Messages, dispatch_request(), rx).await.unwrap();
    assert_eq!(response.status, 200);
}
