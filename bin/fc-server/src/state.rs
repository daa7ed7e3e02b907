//! Shared application state, handed to every handler via axum's `State`
//! extractor. Mirrors the donor's `fc-router::api::AppState`: one `Clone`
//! struct holding `Arc<...>` to each long-lived component, built once in
//! `main` and never mutated itself (the components behind the `Arc`s hold
//! their own interior mutability).

use std::sync::Arc;

use fc_channels::{ChannelStore, KeyCooldownCache, LoadBalancer};
use fc_failover::FailoverEngine;
use fc_metrics::MetricsRegistry;
use fc_requestlog::RequestLogStore;
use fc_scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub channels: Arc<dyn ChannelStore>,
    pub load_balancer: Arc<LoadBalancer>,
    pub cooldown: Arc<KeyCooldownCache>,
    pub failover: Arc<FailoverEngine>,
    pub metrics: Arc<MetricsRegistry>,
    pub request_log: Arc<dyn RequestLogStore>,
    pub scheduler: Arc<Scheduler>,
    pub user_agent_defaults: fc_config::UserAgentConfig,
}
