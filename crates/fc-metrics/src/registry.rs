//! Per-channel metrics and circuit-breaker state.
//!
//! Bucketed by UID when the channel carries one, else by a legacy
//! `__idx__:N` key. [`MetricsRegistry::reconcile_identities`] is the only
//! place bucket keys change; counters are never summed across a remap, only
//! relabeled, mirroring the donor's `CircuitBreakerRegistry` shape for a
//! per-endpoint `RwLock<Vec<bool>>` generalized to a dual-keyed map.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

const RECENT_CALLS_CAP: usize = 20;

fn history_retention() -> ChronoDuration {
    ChronoDuration::hours(24)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    Uid(String),
    Idx(usize),
}

impl BucketKey {
    fn for_channel(channel_uid: &str, channel_index: usize) -> Self {
        if channel_uid.is_empty() {
            BucketKey::Idx(channel_index)
        } else {
            BucketKey::Uid(channel_uid.to_string())
        }
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketKey::Uid(uid) => write!(f, "{uid}"),
            BucketKey::Idx(idx) => write!(f, "__idx__:{idx}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecentCall {
    pub at: DateTime<Utc>,
    pub status_code: u16,
    pub model: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    at: DateTime<Utc>,
    success: bool,
}

pub struct ChannelMetrics {
    pub owner_channel_name: String,
    pub routed_channel_name: String,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    recent_results: RwLock<VecDeque<bool>>,
    recent_calls: RwLock<VecDeque<RecentCall>>,
    request_history: RwLock<VecDeque<HistoryEntry>>,
    circuit_broken_at: RwLock<Option<DateTime<Utc>>>,
}

impl ChannelMetrics {
    fn new(owner_channel_name: String) -> Self {
        Self {
            owner_channel_name,
            routed_channel_name: String::new(),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            recent_results: RwLock::new(VecDeque::new()),
            recent_calls: RwLock::new(VecDeque::new()),
            request_history: RwLock::new(VecDeque::new()),
            circuit_broken_at: RwLock::new(None),
        }
    }

    pub fn is_circuit_broken(&self) -> bool {
        self.circuit_broken_at.read().is_some()
    }

    pub fn circuit_broken_at(&self) -> Option<DateTime<Utc>> {
        *self.circuit_broken_at.read()
    }

    pub fn failure_rate(&self) -> f64 {
        let results = self.recent_results.read();
        if results.is_empty() {
            return 0.0;
        }
        let failures = results.iter().filter(|r| !**r).count();
        failures as f64 / results.len() as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub circuit_recovery: std::time::Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            circuit_recovery: std::time::Duration::from_secs(15 * 60),
        }
    }
}

pub struct MetricsRegistry {
    buckets: DashMap<BucketKey, Arc<ChannelMetrics>>,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Records against a UID bucket for the first time migrate any existing
    /// legacy `Idx` bucket for the same channel position instead of starting
    /// a fresh, empty one — `reconcile_identities` performs the same
    /// migration in bulk, but a caller may record before it next runs.
    fn get_or_create(&self, channel_uid: &str, channel_index: usize, owner_name: &str) -> Arc<ChannelMetrics> {
        let key = BucketKey::for_channel(channel_uid, channel_index);
        if let BucketKey::Uid(_) = &key {
            if !self.buckets.contains_key(&key) {
                let legacy_key = BucketKey::Idx(channel_index);
                if let Some((_, bucket)) = self.buckets.remove(&legacy_key) {
                    self.buckets.insert(key.clone(), bucket);
                }
            }
        }
        self.buckets
            .entry(key)
            .or_insert_with(|| Arc::new(ChannelMetrics::new(owner_name.to_string())))
            .clone()
    }

    pub fn get(&self, channel_uid: &str, channel_index: usize) -> Option<Arc<ChannelMetrics>> {
        let key = BucketKey::for_channel(channel_uid, channel_index);
        self.buckets.get(&key).map(|b| b.clone())
    }

    pub fn record_success(
        &self,
        channel_index: usize,
        channel_uid: &str,
        model: &str,
        owner_channel_name: &str,
        routed_channel_name: &str,
    ) {
        let bucket = self.get_or_create(channel_uid, channel_index, owner_channel_name);
        bucket.successful_calls.fetch_add(1, Ordering::Relaxed);
        self.push_result(&bucket, true, 200, model, routed_channel_name);
        *bucket.circuit_broken_at.write() = None;
    }

    pub fn record_failure(
        &self,
        channel_index: usize,
        channel_uid: &str,
        status_code: u16,
        model: &str,
        owner_channel_name: &str,
        routed_channel_name: &str,
    ) {
        let bucket = self.get_or_create(channel_uid, channel_index, owner_channel_name);
        bucket.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.push_result(&bucket, false, status_code, model, routed_channel_name);

        let window_size = self.config.window_size;
        let already_broken = bucket.circuit_broken_at.read().is_some();
        if !already_broken {
            let results = bucket.recent_results.read();
            if results.len() >= window_size / 2 && bucket.failure_rate() >= self.config.failure_threshold {
                drop(results);
                *bucket.circuit_broken_at.write() = Some(Utc::now());
            }
        }
    }

    fn push_result(&self, bucket: &ChannelMetrics, success: bool, status_code: u16, model: &str, routed_name: &str) {
        {
            let mut results = bucket.recent_results.write();
            if results.len() >= self.config.window_size {
                results.pop_front();
            }
            results.push_back(success);
        }
        {
            let mut calls = bucket.recent_calls.write();
            if calls.len() >= RECENT_CALLS_CAP {
                calls.pop_front();
            }
            calls.push_back(RecentCall {
                at: Utc::now(),
                status_code,
                model: model.to_string(),
                success,
            });
        }
        {
            let mut history = bucket.request_history.write();
            history.push_back(HistoryEntry { at: Utc::now(), success });
            let cutoff = Utc::now() - history_retention();
            while history.front().map(|e| e.at < cutoff).unwrap_or(false) {
                history.pop_front();
            }
        }
        let _ = routed_name;
    }

    /// Remaps bucket keys to the channel list's current shape. `expected` is
    /// `(uid, index, normalized_name)` for every live channel, in order.
    /// Counters are never transferred between distinct UIDs; buckets with no
    /// claimant are dropped.
    pub fn reconcile_identities(&self, expected: &[(Option<String>, usize, String)]) {
        let mut remapped = 0usize;
        let mut dropped = 0usize;

        let mut claimed: Vec<BucketKey> = Vec::new();
        let mut renames: Vec<(BucketKey, BucketKey)> = Vec::new();

        for (uid, index, _name) in expected {
            let target_key = match uid {
                Some(u) if !u.is_empty() => BucketKey::Uid(u.clone()),
                _ => BucketKey::Idx(*index),
            };

            if self.buckets.contains_key(&target_key) {
                claimed.push(target_key);
                continue;
            }

            // primary: same UID already bucketed under a legacy index key.
            let legacy_key = BucketKey::Idx(*index);
            if let Some(u) = uid.as_ref().filter(|u| !u.is_empty()) {
                if self.buckets.contains_key(&legacy_key) {
                    renames.push((legacy_key.clone(), BucketKey::Uid(u.clone())));
                    claimed.push(BucketKey::Uid(u.clone()));
                    continue;
                }
            }
            claimed.push(target_key);
        }

        for (from, to) in renames {
            if let Some((_, bucket)) = self.buckets.remove(&from) {
                self.buckets.insert(to, bucket);
                remapped += 1;
            }
        }

        let claimed_set: std::collections::HashSet<BucketKey> = claimed.into_iter().collect();
        let to_drop: Vec<BucketKey> = self
            .buckets
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| !claimed_set.contains(k))
            .collect();
        for key in to_drop {
            self.buckets.remove(&key);
            dropped += 1;
        }

        info!(remapped, dropped, "reconciled channel metrics identities");
    }

    pub fn open_count(&self) -> usize {
        self.buckets.iter().filter(|b| b.is_circuit_broken()).count()
    }

    /// Spawns the once-a-minute circuit recovery task.
    pub fn spawn_recovery_reaper(
        self: &Arc<Self>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.recover_stale_circuits(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn recover_stale_circuits(&self) {
        let recovery = ChronoDuration::from_std(self.config.circuit_recovery).unwrap_or(ChronoDuration::minutes(15));
        let now = Utc::now();
        for bucket in self.buckets.iter() {
            let broken_at = *bucket.circuit_broken_at.read();
            if let Some(at) = broken_at {
                if now - at >= recovery {
                    bucket.recent_results.write().clear();
                    *bucket.circuit_broken_at.write() = None;
                }
            }
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_trips_once_failure_rate_crosses_threshold() {
        let registry = MetricsRegistry::new(MetricsConfig {
            window_size: 10,
            failure_threshold: 0.5,
            circuit_recovery: std::time::Duration::from_secs(900),
        });
        for _ in 0..4 {
            registry.record_failure(0, "uid-1", 500, "m", "owner", "owner");
        }
        let bucket = registry.get("uid-1", 0).unwrap();
        assert!(!bucket.is_circuit_broken(), "below window_size/2 samples should not trip yet");

        registry.record_failure(0, "uid-1", 500, "m", "owner", "owner");
        let bucket = registry.get("uid-1", 0).unwrap();
        assert!(bucket.is_circuit_broken());
    }

    #[test]
    fn success_clears_circuit_broken_state() {
        let registry = MetricsRegistry::default();
        for _ in 0..10 {
            registry.record_failure(0, "uid-1", 500, "m", "owner", "owner");
        }
        assert!(registry.get("uid-1", 0).unwrap().is_circuit_broken());
        registry.record_success(0, "uid-1", "m", "owner", "owner");
        assert!(!registry.get("uid-1", 0).unwrap().is_circuit_broken());
    }

    #[test]
    fn legacy_index_bucket_migrates_to_uid_on_first_uid_record() {
        let registry = MetricsRegistry::default();
        registry.record_success(2, "", "m", "owner", "owner");
        assert!(registry.get("", 2).is_some());

        registry.reconcile_identities(&[(Some("uid-2".to_string()), 2, "owner".to_string())]);
        assert!(registry.get("uid-2", 2).is_some());
        assert!(registry.get("", 2).is_none());
    }

    #[test]
    fn get_or_create_migrates_legacy_bucket_without_reconcile() {
        let registry = MetricsRegistry::default();
        registry.record_failure(2, "", 500, "m", "owner", "owner");
        assert!(registry.get("", 2).is_some());

        // a UID gets assigned and recorded against before reconcile_identities
        // ever runs for it; the legacy history must carry over, not be lost.
        registry.record_success(2, "uid-2", "m", "owner", "owner");
        let bucket = registry.get("uid-2", 2).unwrap();
        assert_eq!(bucket.failed_calls.load(Ordering::Relaxed), 1);
        assert_eq!(bucket.successful_calls.load(Ordering::Relaxed), 1);
        assert!(registry.get("", 2).is_none());
    }

    #[test]
    fn unclaimed_buckets_are_dropped_on_reconcile() {
        let registry = MetricsRegistry::default();
        registry.record_success(5, "uid-stale", "m", "owner", "owner");
        registry.reconcile_identities(&[(Some("uid-fresh".to_string()), 0, "owner".to_string())]);
        assert!(registry.get("uid-stale", 5).is_none());
    }

    #[test]
    fn counters_are_not_summed_across_a_remap() {
        let registry = MetricsRegistry::default();
        registry.record_success(0, "", "m", "owner", "owner");
        registry.record_success(0, "", "m", "owner", "owner");
        registry.reconcile_identities(&[(Some("uid-1".to_string()), 0, "owner".to_string())]);
        let bucket = registry.get("uid-1", 0).unwrap();
        assert_eq!(bucket.successful_calls.load(Ordering::Relaxed), 2);
    }
}
