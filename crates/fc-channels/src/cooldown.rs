//! Per-key cooldown cache.
//!
//! Advisory, not authoritative: the load balancer may still pick a cooled key
//! when every key is cooled. Shaped after `fc-router::pool::ProcessPool`'s use
//! of `DashMap` for lock-free concurrent state plus a background reaper
//! spawned the way `standby::spawn_leadership_monitor` spawns its ticker.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct KeyFailure {
    pub timestamp: DateTime<Utc>,
    pub failure_count: u32,
}

pub struct CooldownConfig {
    pub base_window: Duration,
    pub max_failure_count: u32,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            base_window: Duration::from_secs(300),
            max_failure_count: 3,
        }
    }
}

pub struct KeyCooldownCache {
    entries: DashMap<String, KeyFailure>,
    config: CooldownConfig,
}

impl KeyCooldownCache {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn mark(&self, key: &str) {
        self.entries
            .entry(key.to_string())
            .and_modify(|f| {
                f.failure_count += 1;
                f.timestamp = Utc::now();
            })
            .or_insert(KeyFailure {
                timestamp: Utc::now(),
                failure_count: 1,
            });
    }

    fn window_for(&self, failure_count: u32) -> Duration {
        if failure_count <= self.config.max_failure_count {
            self.config.base_window
        } else {
            self.config.base_window * 2
        }
    }

    pub fn is_failed(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) => {
                let window = self.window_for(entry.failure_count);
                let elapsed = Utc::now() - entry.timestamp;
                elapsed < chrono::Duration::from_std(window).unwrap_or_default()
            }
            None => false,
        }
    }

    /// The failed-at-or-oldest key among `candidates`, used when every key is
    /// cooled and the caller must still proceed.
    pub fn oldest_failed<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates
            .iter()
            .filter_map(|k| self.entries.get(*k).map(|f| (*k, f.timestamp)))
            .min_by_key(|(_, ts)| *ts)
            .map(|(k, _)| k)
    }

    pub fn evict_expired(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, f| {
            let window = self.window_for(f.failure_count);
            Utc::now() - f.timestamp < chrono::Duration::from_std(window).unwrap_or_default()
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "cooldown reaper evicted expired entries");
        }
    }

    pub fn remove_all_for_channel_removal(&self, keys: &[String]) {
        for key in keys {
            self.entries.remove(key);
        }
    }
}

/// Spawns the once-a-minute eviction reaper.
pub fn spawn_reaper(
    cache: Arc<KeyCooldownCache>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => cache.evict_expired(),
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_unfailed_until_marked() {
        let cache = KeyCooldownCache::new(CooldownConfig::default());
        assert!(!cache.is_failed("k1"));
    }

    #[test]
    fn marked_key_is_failed_immediately() {
        let cache = KeyCooldownCache::new(CooldownConfig::default());
        cache.mark("k1");
        assert!(cache.is_failed("k1"));
    }

    #[test]
    fn window_doubles_after_max_failure_count() {
        let cache = KeyCooldownCache::new(CooldownConfig {
            base_window: Duration::from_secs(1),
            max_failure_count: 2,
        });
        for _ in 0..3 {
            cache.mark("k1");
        }
        assert_eq!(cache.window_for(3), Duration::from_secs(2));
        assert_eq!(cache.window_for(1), Duration::from_secs(1));
    }

    #[test]
    fn oldest_failed_picks_earliest_timestamp() {
        let cache = KeyCooldownCache::new(CooldownConfig::default());
        cache.mark("older");
        std::thread::sleep(Duration::from_millis(5));
        cache.mark("newer");
        assert_eq!(cache.oldest_failed(&["older", "newer"]), Some("older"));
    }
}
