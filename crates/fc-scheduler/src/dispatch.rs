//! The per-request scheduling state machine.
//!
//! Composes the channel store, key cooldown cache (via the load balancer),
//! load balancer, error parser, failover engine, composite resolver, and
//! metrics registry into one async call. Grounded in the
//! retry-loop-with-circuit-breaker-gating shape of
//! `fc-router::mediator::HttpMediator::mediate`, generalized from a single
//! webhook target to a pool of channels, each with its own key rotation.
//!
//! When debug logging is enabled on the document, the final request/response
//! pair of a call is masked and gzip-captured into the debug-log table
//! alongside the regular request log entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fc_channels::document::DebugLogSettings;
use fc_channels::{ChannelStore, LoadBalancer};
use fc_common::{Channel, GatewayError, PoolKind, RequestLog, RequestLogStatus, Result};
use fc_failover::{ErrorParserConfig, FailoverEngine};
use fc_metrics::MetricsRegistry;
use fc_requestlog::{compress_body, mask_headers, DebugLogEntry, RequestLogStore};
use tokio::sync::oneshot;

use crate::select;
use crate::upstream::{DispatchRequest, Upstream, UpstreamCallError, UpstreamResponse};

/// Maximum bytes of an error body carried into `GatewayError::UpstreamHttp`
/// and the request log's `error` field.
const ERROR_BODY_PREVIEW: usize = 2048;

pub struct Scheduler {
    channels: Arc<dyn ChannelStore>,
    load_balancer: Arc<LoadBalancer>,
    failover: Arc<FailoverEngine>,
    metrics: Arc<MetricsRegistry>,
    request_log: Arc<dyn RequestLogStore>,
    upstream: Arc<dyn Upstream>,
    error_parser_config: ErrorParserConfig,
}

enum ChannelOutcome {
    Success(UpstreamResponse),
    NextChannel,
    Fatal(GatewayError),
}

impl Scheduler {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        load_balancer: Arc<LoadBalancer>,
        failover: Arc<FailoverEngine>,
        metrics: Arc<MetricsRegistry>,
        request_log: Arc<dyn RequestLogStore>,
        upstream: Arc<dyn Upstream>,
        error_parser_config: ErrorParserConfig,
    ) -> Self {
        Self {
            channels,
            load_balancer,
            failover,
            metrics,
            request_log,
            upstream,
            error_parser_config,
        }
    }

    /// Runs S0-S6 to completion. `cancel` resolves when the client hangs up;
    /// it is polled around S3 and around the retry `wait` so neither an
    /// in-flight call nor a pending backoff outlives the client.
    pub async fn dispatch(
        &self,
        pool: PoolKind,
        request: DispatchRequest,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<UpstreamResponse> {
        let mut log = blank_log(&request);
        if let Err(e) = self.request_log.add(log.clone()).await {
            tracing::warn!(error = %e, "failed to persist pending request log");
        }

        let debug_log_settings = match self.channels.snapshot().await {
            Ok(doc) => doc.debug_log,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load debug-log settings, treating as disabled");
                DebugLogSettings::default()
            }
        };

        let mut tried_channels: HashSet<String> = HashSet::new();
        let outcome = self.run(pool, &request, &mut tried_channels, &mut cancel, &mut log, &debug_log_settings).await;

        self.finalize_log(&mut log, &outcome);
        if let Err(e) = self.request_log.update(&log.id, log.clone()).await {
            tracing::warn!(error = %e, "failed to persist completed request log");
        }

        outcome
    }

    async fn run(
        &self,
        pool: PoolKind,
        request: &DispatchRequest,
        tried_channels: &mut HashSet<String>,
        cancel: &mut oneshot::Receiver<()>,
        log: &mut RequestLog,
        debug_log_settings: &DebugLogSettings,
    ) -> Result<UpstreamResponse> {
        loop {
            let snapshot = self.channels.get_all(pool).await?;

            let candidate = select::next_candidate(&snapshot, tried_channels).ok_or(GatewayError::NoChannels)?;

            let (effective_channel, effective_model) = match resolve_target(&candidate, &snapshot, &request.model) {
                Some(resolved) => resolved,
                None => {
                    tried_channels.insert(candidate.id.clone());
                    continue;
                }
            };

            log.channel_id = effective_channel.index;
            log.channel_uid = Some(effective_channel.id.clone());
            log.channel_name = Some(effective_channel.name.clone());

            match self
                .run_channel(pool, &effective_channel, &effective_model, request, cancel, log, debug_log_settings)
                .await
            {
                ChannelOutcome::Success(resp) => return Ok(resp),
                ChannelOutcome::NextChannel => {
                    // the resolved target may itself have already been tried
                    // (e.g. two composite channels mapping to the same
                    // concrete channel), so exclude it alongside the
                    // top-level candidate.
                    tried_channels.insert(candidate.id.clone());
                    tried_channels.insert(effective_channel.id.clone());
                    continue;
                }
                ChannelOutcome::Fatal(err) => return Err(err),
            }
        }
    }

    /// S2-S5 for one resolved channel: picks a key, calls upstream, and
    /// loops on `Retry` decisions without changing key.
    async fn run_channel(
        &self,
        pool: PoolKind,
        channel: &Channel,
        model: &str,
        request: &DispatchRequest,
        cancel: &mut oneshot::Receiver<()>,
        log: &mut RequestLog,
        debug_log_settings: &DebugLogSettings,
    ) -> ChannelOutcome {
        let strategy = channel.key_load_balance.unwrap_or_default();
        let mut tried_keys: HashMap<String, ()> = HashMap::new();

        loop {
            let key = match self.load_balancer.pick(pool, &channel.api_keys, &tried_keys, strategy) {
                Ok(k) => k.to_string(),
                Err(_) => return ChannelOutcome::NextChannel,
            };

            match self.call_with_retries(channel, model, &key, request, cancel, log, debug_log_settings).await {
                KeyOutcome::Success(resp) => return ChannelOutcome::Success(resp),
                KeyOutcome::NextKey => {
                    tried_keys.insert(key, ());
                    if tried_keys.len() < channel.api_keys.len() {
                        continue;
                    }
                    return ChannelOutcome::NextChannel;
                }
                KeyOutcome::SuspendAndNextChannel(reason) => {
                    if let Some(idx) = channel.index {
                        if let Err(e) = self.channels.set_status(pool, idx, "suspended").await {
                            tracing::warn!(error = %e, channel = %channel.name, "failed to suspend channel");
                        }
                    }
                    tracing::warn!(channel = %channel.name, reason = %reason, "channel suspended by failover decision");
                    return ChannelOutcome::NextChannel;
                }
                KeyOutcome::Fatal(err) => return ChannelOutcome::Fatal(err),
            }
        }
    }

    /// S3-S5 for one fixed `(channel, key)` pair: retries in place until a
    /// non-`Retry` decision is reached.
    async fn call_with_retries(
        &self,
        channel: &Channel,
        model: &str,
        key: &str,
        request: &DispatchRequest,
        cancel: &mut oneshot::Receiver<()>,
        log: &mut RequestLog,
        debug_log_settings: &DebugLogSettings,
    ) -> KeyOutcome {
        let channel_index = channel.index.unwrap_or(0);

        loop {
            if cancel.try_recv().is_ok() {
                log.status = RequestLogStatus::Error;
                log.error = Some("client canceled the request".to_string());
                return KeyOutcome::Fatal(GatewayError::ClientCanceled);
            }

            let call = self.upstream.call(channel, key, request);
            let outcome = tokio::select! {
                result = call => result,
                _ = &mut *cancel => {
                    log.status = RequestLogStatus::Error;
                    log.error = Some("client canceled the request".to_string());
                    return KeyOutcome::Fatal(GatewayError::ClientCanceled);
                }
            };

            let response = match outcome {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    self.metrics.record_success(channel_index, &channel.id, model, &channel.name, &channel.name);
                    self.failover.reset_on_success(&channel.id, key);
                    self.record_debug_log(debug_log_settings, &log.id, request, &resp).await;
                    return KeyOutcome::Success(resp);
                }
                Ok(resp) => resp,
                Err(UpstreamCallError::Timeout) => {
                    self.metrics.record_failure(channel_index, &channel.id, 0, model, &channel.name, &channel.name);
                    log.status = RequestLogStatus::Timeout;
                    log.error = Some("request timed out".to_string());
                    return KeyOutcome::Fatal(GatewayError::Timeout);
                }
                Err(UpstreamCallError::Transport(e)) => {
                    self.metrics.record_failure(channel_index, &channel.id, 0, model, &channel.name, &channel.name);
                    log.status = RequestLogStatus::Error;
                    log.error = Some(e.clone());
                    return KeyOutcome::Fatal(GatewayError::UpstreamTransport(e));
                }
            };

            let body_text = String::from_utf8_lossy(&response.body).to_string();
            let parsed = fc_failover::parse_error(response.status, &body_text, &self.error_parser_config);
            let decision = self.failover.decide(&channel.id, key, &parsed);
            self.metrics.record_failure(channel_index, &channel.id, response.status, model, &channel.name, &channel.name);

            match decision {
                fc_common::Decision::Retry { wait_secs, .. } => {
                    log.status = RequestLogStatus::RetryWait;
                    log.failover_info = Some(format!("retrying {} in {wait_secs}s", parsed.error_code_pattern()));
                    let sleep = tokio::time::sleep(Duration::from_secs(wait_secs));
                    tokio::select! {
                        _ = sleep => continue,
                        _ = &mut *cancel => {
                            log.status = RequestLogStatus::Error;
                            log.error = Some("client canceled the request".to_string());
                            return KeyOutcome::Fatal(GatewayError::ClientCanceled);
                        }
                    }
                }
                fc_common::Decision::FailoverKey { deprioritize_key, .. } => {
                    self.load_balancer_cooldown_mark(key);
                    if deprioritize_key {
                        if let Err(e) = self.channels.deprioritize_api_key(key).await {
                            tracing::warn!(error = %e, "failed to deprioritize key after quota-related failover");
                        }
                    }
                    log.status = RequestLogStatus::Failover;
                    log.failover_info = Some(format!("key failover on {}", parsed.error_code_pattern()));
                    return KeyOutcome::NextKey;
                }
                fc_common::Decision::SuspendChannel { reason } => {
                    log.status = RequestLogStatus::Failover;
                    log.failover_info = Some(format!("channel suspended: {reason}"));
                    return KeyOutcome::SuspendAndNextChannel(reason);
                }
                fc_common::Decision::None { reason } => {
                    log.status = RequestLogStatus::Error;
                    log.error = Some(format!("{reason}: {}", truncate(&body_text, ERROR_BODY_PREVIEW)));
                    self.record_debug_log(debug_log_settings, &log.id, request, &response).await;
                    return KeyOutcome::Fatal(GatewayError::UpstreamHttp {
                        status: response.status,
                        subtype: parsed.subtype,
                        body: truncate(&body_text, ERROR_BODY_PREVIEW),
                    });
                }
            }
        }
    }

    /// The cooldown cache itself lives behind the load balancer; marking a
    /// key failed is exposed through `LoadBalancer`.
    fn load_balancer_cooldown_mark(&self, key: &str) {
        self.load_balancer.mark_key_failed(key);
    }

    /// Captures one `(request, response)` pair into the debug-log table,
    /// masking sensitive headers and gzip-truncating bodies per
    /// `settings.max_body_size`. No-op unless debug logging is enabled.
    async fn record_debug_log(
        &self,
        settings: &DebugLogSettings,
        request_id: &str,
        request: &DispatchRequest,
        response: &UpstreamResponse,
    ) {
        if !settings.enabled {
            return;
        }

        let mut request_headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect();
        let mut response_headers: Vec<(String, String)> = response
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect();
        mask_headers(&mut request_headers);
        mask_headers(&mut response_headers);

        let request_body = match compress_body(&request.body, settings.max_body_size) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to compress debug-log request body");
                return;
            }
        };
        let response_body = match compress_body(&response.body, settings.max_body_size) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to compress debug-log response body");
                return;
            }
        };

        let entry = DebugLogEntry {
            request_id: request_id.to_string(),
            request_headers,
            request_body,
            response_headers,
            response_body,
            created_at: Utc::now(),
        };
        if let Err(e) = self.request_log.record_debug_log(entry).await {
            tracing::warn!(error = %e, "failed to persist debug log entry");
        }
    }

    fn finalize_log(&self, log: &mut RequestLog, outcome: &Result<UpstreamResponse>) {
        let now = Utc::now();
        log.complete_time = Some(now);
        log.duration_ms = Some((now - log.initial_time).num_milliseconds().max(0) as u64);
        match outcome {
            Ok(_) => {
                log.status = RequestLogStatus::Completed;
                log.error = None;
            }
            Err(e) if log.status == RequestLogStatus::Pending || log.status == RequestLogStatus::RetryWait || log.status == RequestLogStatus::Failover => {
                log.status = RequestLogStatus::Error;
                log.error = Some(e.to_string());
            }
            Err(e) => {
                log.error.get_or_insert_with(|| e.to_string());
            }
        }
    }
}

enum KeyOutcome {
    Success(UpstreamResponse),
    NextKey,
    SuspendAndNextChannel(String),
    Fatal(GatewayError),
}

fn resolve_target(candidate: &Channel, snapshot: &[Channel], requested_model: &str) -> Option<(Channel, String)> {
    if candidate.service_type != fc_common::ServiceType::Composite {
        return Some((candidate.clone(), requested_model.to_string()));
    }
    let resolved = fc_channels::resolve_composite(candidate, requested_model, snapshot);
    let target_index = resolved.target_index?;
    let target = snapshot.get(target_index)?;
    if !target.status.is_dispatch_eligible() {
        return None;
    }
    Some((target.clone(), resolved.effective_model))
}

fn blank_log(request: &DispatchRequest) -> RequestLog {
    RequestLog {
        id: fc_common::generate_request_log_id(),
        status: RequestLogStatus::Pending,
        initial_time: Utc::now(),
        complete_time: None,
        duration_ms: None,
        input_tokens: None,
        output_tokens: None,
        cache_creation_tokens: None,
        cache_read_tokens: None,
        total_tokens: None,
        input_cost: None,
        output_cost: None,
        total_cost: None,
        channel_id: None,
        channel_uid: None,
        channel_name: None,
        endpoint: request.endpoint.clone(),
        client_id: request.client_id.clone(),
        session_id: request.session_id.clone(),
        api_key_id: None,
        failover_info: None,
        error: None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fc_channels::{ChannelPatch, GatewayDocument, UpdateOutcome};
    use fc_common::{ChannelStatus, ServiceType};
    use fc_requestlog::{DebugLogEntry, RequestLogFilter, RequestLogStats};
    use std::sync::Mutex;

    fn channel(id: &str, index: usize, keys: &[&str]) -> Channel {
        Channel {
            id: id.to_string(),
            index: Some(index),
            name: id.to_string(),
            service_type: ServiceType::Claude,
            base_url: "https://example.test".into(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
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

    struct FakeChannelStore {
        channels: Mutex<Vec<Channel>>,
        debug_log: DebugLogSettings,
    }

    impl FakeChannelStore {
        fn new(channels: Vec<Channel>) -> Self {
            Self { channels: Mutex::new(channels), debug_log: DebugLogSettings::default() }
        }

        fn with_debug_log(channels: Vec<Channel>, debug_log: DebugLogSettings) -> Self {
            Self { channels: Mutex::new(channels), debug_log }
        }
    }

    #[async_trait]
    impl ChannelStore for FakeChannelStore {
        async fn get_all(&self, _kind: PoolKind) -> fc_channels::error::Result<Vec<Channel>> {
            Ok(self.channels.lock().unwrap().clone())
        }
        async fn get_current(&self, _kind: PoolKind) -> fc_channels::error::Result<Channel> {
            self.channels.lock().unwrap().first().cloned().ok_or(fc_channels::ChannelStoreError::NoChannels)
        }
        async fn add(&self, _kind: PoolKind, channel: Channel) -> fc_channels::error::Result<Channel> {
            self.channels.lock().unwrap().push(channel.clone());
            Ok(channel)
        }
        async fn update(&self, _kind: PoolKind, _index: usize, _patch: ChannelPatch) -> fc_channels::error::Result<UpdateOutcome> {
            Ok(UpdateOutcome::default())
        }
        async fn remove(&self, _kind: PoolKind, index: usize) -> fc_channels::error::Result<Channel> {
            Ok(self.channels.lock().unwrap().remove(index))
        }
        async fn set_status(&self, _kind: PoolKind, index: usize, status: &str) -> fc_channels::error::Result<()> {
            let mut channels = self.channels.lock().unwrap();
            let status = ChannelStatus::parse(status).unwrap();
            channels[index].status = status;
            Ok(())
        }
        async fn set_promotion(&self, _kind: PoolKind, _index: usize, _duration_secs: i64) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn reorder(&self, _kind: PoolKind, _index_list: &[usize]) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn add_api_key(&self, _kind: PoolKind, _index: usize, _key: String) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn remove_api_key_by_index(&self, _kind: PoolKind, _index: usize, _key_index: usize) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn move_api_key_top_by_index(&self, _kind: PoolKind, _index: usize, _key_index: usize) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn move_api_key_bottom_by_index(&self, _kind: PoolKind, _index: usize, _key_index: usize) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn deprioritize_api_key(&self, key: &str) -> fc_channels::error::Result<()> {
            let mut channels = self.channels.lock().unwrap();
            for c in channels.iter_mut() {
                if let Some(pos) = c.api_keys.iter().position(|k| k == key) {
                    let k = c.api_keys.remove(pos);
                    c.api_keys.push(k);
                }
            }
            Ok(())
        }
        async fn snapshot(&self) -> fc_channels::error::Result<GatewayDocument> {
            let mut doc = GatewayDocument::default();
            doc.debug_log = self.debug_log.clone();
            Ok(doc)
        }
        async fn set_debug_log_settings(&self, _settings: fc_channels::document::DebugLogSettings) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn set_failover_settings(&self, _settings: fc_channels::document::FailoverSettings) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn set_user_agent_settings(&self, _settings: fc_channels::document::UserAgentSettings) -> fc_channels::error::Result<()> {
            Ok(())
        }
        async fn set_load_balance(
            &self,
            _kind: PoolKind,
            _strategy: Option<fc_common::LoadBalanceStrategy>,
        ) -> fc_channels::error::Result<()> {
            Ok(())
        }
    }

    struct FakeRequestLogStore {
        logs: Mutex<HashMap<String, RequestLog>>,
        debug_logs: Mutex<HashMap<String, DebugLogEntry>>,
        broadcaster: Arc<fc_requestlog::LogEventBroadcaster>,
    }

    impl FakeRequestLogStore {
        fn new() -> Self {
            Self {
                logs: Mutex::new(HashMap::new()),
                debug_logs: Mutex::new(HashMap::new()),
                broadcaster: Arc::new(fc_requestlog::LogEventBroadcaster::new(10)),
            }
        }
    }

    #[async_trait]
    impl RequestLogStore for FakeRequestLogStore {
        async fn add(&self, log: RequestLog) -> fc_requestlog::error::Result<RequestLog> {
            self.logs.lock().unwrap().insert(log.id.clone(), log.clone());
            Ok(log)
        }
        async fn update(&self, id: &str, log: RequestLog) -> fc_requestlog::error::Result<()> {
            self.logs.lock().unwrap().insert(id.to_string(), log);
            Ok(())
        }
        async fn get_recent(&self, _filter: RequestLogFilter) -> fc_requestlog::error::Result<Vec<RequestLog>> {
            Ok(self.logs.lock().unwrap().values().cloned().collect())
        }
        async fn get_stats(&self, _filter: RequestLogFilter) -> fc_requestlog::error::Result<RequestLogStats> {
            Ok(RequestLogStats::default())
        }
        async fn cleanup(&self, _older_than_days: u32) -> fc_requestlog::error::Result<u64> {
            Ok(0)
        }
        async fn cleanup_stale_pending(&self, _older_than_seconds: u64) -> fc_requestlog::error::Result<u64> {
            Ok(0)
        }
        async fn record_debug_log(&self, entry: DebugLogEntry) -> fc_requestlog::error::Result<()> {
            self.debug_logs.lock().unwrap().insert(entry.request_id.clone(), entry);
            Ok(())
        }
        async fn get_debug_log(&self, request_id: &str) -> fc_requestlog::error::Result<Option<DebugLogEntry>> {
            Ok(self.debug_logs.lock().unwrap().get(request_id).cloned())
        }
        fn broadcaster(&self) -> &Arc<fc_requestlog::LogEventBroadcaster> {
            &self.broadcaster
        }
    }

    struct FakeUpstream {
        responses: Mutex<Vec<std::result::Result<UpstreamResponse, UpstreamCallError>>>,
    }

    impl FakeUpstream {
        fn new(responses: Vec<std::result::Result<UpstreamResponse, UpstreamCallError>>) -> Self {
            Self { responses: Mutex::new(responses) }
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn call(&self, _channel: &Channel, _key: &str, _request: &DispatchRequest) -> std::result::Result<UpstreamResponse, UpstreamCallError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                panic!("fake upstream exhausted its canned responses");
            }
            responses.remove(0)
        }
    }

    fn ok_response(status: u16) -> UpstreamResponse {
        UpstreamResponse { status, headers: reqwest::header::HeaderMap::new(), body: bytes::Bytes::from_static(b"{}") }
    }

    fn error_response(status: u16, body: &'static str) -> UpstreamResponse {
        UpstreamResponse { status, headers: reqwest::header::HeaderMap::new(), body: bytes::Bytes::from_static(body.as_bytes()) }
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            method: reqwest::Method::POST,
            path: "/v1/messages".to_string(),
            headers: reqwest::header::HeaderMap::new(),
            body: bytes::Bytes::from_static(b"{}"),
            model: "claude-3-5-sonnet".to_string(),
            endpoint: "/v1/messages".to_string(),
            client_id: None,
            session_id: None,
        }
    }

    fn scheduler(channels: Vec<Channel>, upstream: FakeUpstream) -> (Scheduler, Arc<FakeRequestLogStore>) {
        scheduler_with_channel_store(FakeChannelStore::new(channels), upstream)
    }

    fn scheduler_with_channel_store(
        channels: FakeChannelStore,
        upstream: FakeUpstream,
    ) -> (Scheduler, Arc<FakeRequestLogStore>) {
        let request_log = Arc::new(FakeRequestLogStore::new());
        let cooldown = Arc::new(fc_channels::KeyCooldownCache::new(fc_channels::CooldownConfig::default()));
        let scheduler = Scheduler::new(
            Arc::new(channels),
            Arc::new(LoadBalancer::new(cooldown)),
            Arc::new(FailoverEngine::with_default_rules()),
            Arc::new(MetricsRegistry::default()),
            request_log.clone(),
            Arc::new(upstream),
            ErrorParserConfig::default(),
        );
        (scheduler, request_log)
    }

    #[tokio::test]
    async fn first_try_success_completes_and_logs() {
        let channels = vec![channel("a", 0, &["k1"])];
        let (scheduler, logs) = scheduler(channels, FakeUpstream::new(vec![Ok(ok_response(200))]));
        let (_tx, rx) = oneshot::channel();

        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(result.is_ok());

        let stored = logs.logs.lock().unwrap();
        let log = stored.values().next().unwrap();
        assert_eq!(log.status, RequestLogStatus::Completed);
        assert_eq!(log.channel_uid.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn transport_error_is_fatal_without_failover() {
        let channels = vec![channel("a", 0, &["k1"]), channel("b", 1, &["k2"])];
        let upstream = FakeUpstream::new(vec![Err(UpstreamCallError::Transport("unreachable".into()))]);
        let (scheduler, _logs) = scheduler(channels, upstream);
        let (_tx, rx) = oneshot::channel();
        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(matches!(result, Err(GatewayError::UpstreamTransport(_))));
    }

    #[tokio::test]
    async fn unauthorized_fails_over_to_next_channel() {
        let channels = vec![channel("a", 0, &["k1"]), channel("b", 1, &["k2"])];
        let upstream = FakeUpstream::new(vec![Ok(error_response(401, "{}")), Ok(ok_response(200))]);
        let (scheduler, logs) = scheduler(channels, upstream);
        let (_tx, rx) = oneshot::channel();

        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(result.is_ok());
        let stored = logs.logs.lock().unwrap();
        let log = stored.values().next().unwrap();
        assert_eq!(log.channel_uid.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn quota_exhausted_suspends_channel_and_fails_over() {
        let channels = vec![channel("a", 0, &["k1"]), channel("b", 1, &["k2"])];
        let body = r#"{"error":{"status":"RESOURCE_EXHAUSTED","details":[{"reason":"QUOTA_EXHAUSTED"}]}}"#;
        let upstream = FakeUpstream::new(vec![Ok(error_response(429, body)), Ok(ok_response(200))]);
        let (scheduler, _logs) = scheduler(channels, upstream);
        let (_tx, rx) = oneshot::channel();

        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn no_eligible_channels_is_no_channels_error() {
        let (scheduler, _logs) = scheduler(vec![], FakeUpstream::new(vec![]));
        let (_tx, rx) = oneshot::channel();
        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(matches!(result, Err(GatewayError::NoChannels)));
    }

    #[tokio::test]
    async fn client_cancellation_before_call_is_client_canceled() {
        let channels = vec![channel("a", 0, &["k1"])];
        let (scheduler, logs) = scheduler(channels, FakeUpstream::new(vec![Ok(ok_response(200))]));
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();

        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(matches!(result, Err(GatewayError::ClientCanceled)));
        let stored = logs.logs.lock().unwrap();
        let log = stored.values().next().unwrap();
        assert_eq!(log.status, RequestLogStatus::Error);
    }

    #[tokio::test]
    async fn debug_log_is_recorded_on_success_when_enabled() {
        let channels = FakeChannelStore::with_debug_log(
            vec![channel("a", 0, &["k1"])],
            DebugLogSettings { enabled: true, retention_hours: 24, max_body_size: 1024 },
        );
        let (scheduler, logs) = scheduler_with_channel_store(channels, FakeUpstream::new(vec![Ok(ok_response(200))]));
        let (_tx, rx) = oneshot::channel();

        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(result.is_ok());

        let request_id = logs.logs.lock().unwrap().values().next().unwrap().id.clone();
        let debug_logs = logs.debug_logs.lock().unwrap();
        let entry = debug_logs.get(&request_id).expect("debug log entry recorded");
        assert_eq!(fc_requestlog::decompress_body(&entry.response_body).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn debug_log_is_not_recorded_when_disabled() {
        let channels = vec![channel("a", 0, &["k1"])];
        let (scheduler, logs) = scheduler(channels, FakeUpstream::new(vec![Ok(ok_response(200))]));
        let (_tx, rx) = oneshot::channel();

        let result = scheduler.dispatch(PoolKind::Messages, request(), rx).await;
        assert!(result.is_ok());
        assert!(logs.debug_logs.lock().unwrap().is_empty());
    }
}
