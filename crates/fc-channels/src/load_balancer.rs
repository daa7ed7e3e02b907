//! LoadBalancer: key selection within a channel.
//!
//! Per-pool round-robin counters are `AtomicU64`, matching the counting
//! idiom `fc-router::pool::ProcessPool` uses for its in-flight/rate-limit
//! bookkeeping.

use crate::cooldown::KeyCooldownCache;
use fc_common::{GatewayError, LoadBalanceStrategy, PoolKind, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct LoadBalancer {
    cooldown: Arc<KeyCooldownCache>,
    round_robin_counters: dashmap::DashMap<PoolKind, AtomicU64>,
}

impl LoadBalancer {
    pub fn new(cooldown: Arc<KeyCooldownCache>) -> Self {
        Self {
            cooldown,
            round_robin_counters: dashmap::DashMap::new(),
        }
    }

    /// `tried` = keys already attempted earlier in this same request attempt
    /// (caller-supplied, prevents same-attempt reuse).
    pub fn pick<'a>(
        &self,
        pool: PoolKind,
        all_keys: &'a [String],
        tried: &HashMap<String, ()>,
        strategy: LoadBalanceStrategy,
    ) -> Result<&'a str> {
        if all_keys.is_empty() {
            return Err(GatewayError::NoKeys);
        }

        let available: Vec<&str> = all_keys
            .iter()
            .map(String::as_str)
            .filter(|k| !tried.contains_key(*k))
            .filter(|k| !self.cooldown.is_failed(k))
            .collect();

        if !available.is_empty() {
            return Ok(self.select(pool, &available, strategy));
        }

        // Degrade: all remaining (not-yet-tried) keys are cooled. Pick the
        // oldest-failed one not already tried this attempt and proceed,
        // logging a warning (caller logs; this just selects).
        let untried: Vec<&str> = all_keys
            .iter()
            .map(String::as_str)
            .filter(|k| !tried.contains_key(*k))
            .collect();

        if untried.is_empty() {
            return Err(GatewayError::AllKeysUnavailable);
        }

        match self.cooldown.oldest_failed(&untried) {
            Some(k) => {
                tracing::warn!(key_count = untried.len(), "all keys cooled, degrading to oldest-failed key");
                Ok(k)
            }
            None => Ok(untried[0]),
        }
    }

    /// Marks `key` failed in the underlying cooldown cache. Exposed here
    /// rather than via the cache directly so the scheduler only ever talks
    /// to the load balancer for key-level state.
    pub fn mark_key_failed(&self, key: &str) {
        self.cooldown.mark(key);
    }

    fn select<'a>(&self, pool: PoolKind, available: &[&'a str], strategy: LoadBalanceStrategy) -> &'a str {
        match strategy {
            LoadBalanceStrategy::Failover => available[0],
            LoadBalanceStrategy::RoundRobin => {
                let counter = self
                    .round_robin_counters
                    .entry(pool)
                    .or_insert_with(|| AtomicU64::new(0));
                let n = counter.fetch_add(1, Ordering::Relaxed);
                available[(n as usize) % available.len()]
            }
            LoadBalanceStrategy::Random => {
                let idx = rand::random::<usize>() % available.len();
                available[idx]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownConfig;

    fn lb() -> LoadBalancer {
        LoadBalancer::new(Arc::new(KeyCooldownCache::new(CooldownConfig::default())))
    }

    #[test]
    fn failover_strategy_always_picks_first_available() {
        let lb = lb();
        let keys = vec!["a".to_string(), "b".to_string()];
        let tried = HashMap::new();
        let picked = lb.pick(PoolKind::Messages, &keys, &tried, LoadBalanceStrategy::Failover).unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn round_robin_cycles_through_keys() {
        let lb = lb();
        let keys = vec!["a".to_string(), "b".to_string()];
        let tried = HashMap::new();
        let first = lb.pick(PoolKind::Messages, &keys, &tried, LoadBalanceStrategy::RoundRobin).unwrap();
        let second = lb.pick(PoolKind::Messages, &keys, &tried, LoadBalanceStrategy::RoundRobin).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn empty_keys_is_no_keys_error() {
        let lb = lb();
        let tried = HashMap::new();
        let err = lb.pick(PoolKind::Messages, &[], &tried, LoadBalanceStrategy::Failover).unwrap_err();
        assert!(matches!(err, GatewayError::NoKeys));
    }

    #[test]
    fn all_cooled_and_all_tried_is_all_keys_unavailable() {
        let lb = lb();
        let keys = vec!["a".to_string()];
        lb.cooldown.mark("a");
        let mut tried = HashMap::new();
        tried.insert("a".to_string(), ());
        let err = lb.pick(PoolKind::Messages, &keys, &tried, LoadBalanceStrategy::Failover).unwrap_err();
        assert!(matches!(err, GatewayError::AllKeysUnavailable));
    }

    #[test]
    fn all_cooled_but_untried_degrades_to_oldest_cooled() {
        let lb = lb();
        let keys = vec!["a".to_string(), "b".to_string()];
        lb.cooldown.mark("a");
        lb.cooldown.mark("b");
        let tried = HashMap::new();
        let picked = lb.pick(PoolKind::Messages, &keys, &tried, LoadBalanceStrategy::Failover).unwrap();
        assert_eq!(picked, "a");
    }
}
