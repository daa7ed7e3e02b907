//! Failover rule matching and the per-(channel, key, error group) action
//! chain.

use dashmap::DashMap;
use fc_common::{ActionStep, Decision, FailoverAction, FailoverRule, ParsedError};

/// Quota/credit related subtypes get their key deprioritized on failover so
/// round-robin and failover strategies both stop favoring it immediately.
fn is_quota_related(subtype: &str) -> bool {
    matches!(subtype, "QUOTA_EXHAUSTED" | "CREDIT_EXHAUSTED" | "RESOURCE_EXHAUSTED")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    channel_id: String,
    key: String,
    error_group: String,
}

pub struct FailoverEngine {
    rules: parking_lot::RwLock<Vec<FailoverRule>>,
    attempt_counters: DashMap<CounterKey, u32>,
}

impl FailoverEngine {
    pub fn new(rules: Vec<FailoverRule>) -> Self {
        Self {
            rules: parking_lot::RwLock::new(rules),
            attempt_counters: DashMap::new(),
        }
    }

    pub fn with_default_rules() -> Self {
        Self::new(default_rules())
    }

    /// Takes `&self` (rules live behind a lock) so an `Arc<FailoverEngine>`
    /// shared with the scheduler can still be reconfigured from the admin
    /// surface without a second layer of locking at the call site.
    pub fn set_rules(&self, rules: Vec<FailoverRule>) {
        *self.rules.write() = rules;
        self.attempt_counters.clear();
    }

    pub fn rules(&self) -> Vec<FailoverRule> {
        self.rules.read().clone()
    }

    /// Resets every error-group counter recorded for `(channel_id, key)`.
    /// Called on a successful upstream call.
    pub fn reset_on_success(&self, channel_id: &str, key: &str) {
        self.attempt_counters
            .retain(|k, _| !(k.channel_id == channel_id && k.key == key));
    }

    pub fn decide(&self, channel_id: &str, key: &str, parsed: &ParsedError) -> Decision {
        let exact = parsed.error_code_pattern();
        let status_only = parsed.status_code.to_string();

        let rules = self.rules.read();
        let rule = rules
            .iter()
            .find(|r| r.patterns().any(|p| p == exact))
            .or_else(|| rules.iter().find(|r| r.patterns().any(|p| p == status_only)))
            .or_else(|| rules.iter().find(|r| r.patterns().any(|p| p == "others")));

        let Some(rule) = rule else {
            return Decision::None {
                reason: "no_matching_rule".to_string(),
            };
        };

        self.run_chain(channel_id, key, &exact, rule, parsed)
    }

    fn run_chain(
        &self,
        channel_id: &str,
        key: &str,
        error_group: &str,
        rule: &FailoverRule,
        parsed: &ParsedError,
    ) -> Decision {
        let counter_key = CounterKey {
            channel_id: channel_id.to_string(),
            key: key.to_string(),
            error_group: error_group.to_string(),
        };

        let mut attempts = self.attempt_counters.entry(counter_key.clone()).or_insert(0);
        let mut step_index = 0usize;

        loop {
            let Some(step) = rule.action_chain.get(step_index) else {
                // chain exhausted without a terminal decision; surface to client.
                return Decision::None {
                    reason: "failover_chain_exhausted".to_string(),
                };
            };

            match step.action {
                FailoverAction::Retry => {
                    if *attempts < step.max_attempts {
                        *attempts += 1;
                        let wait = if step.wait_seconds > 0 {
                            step.wait_seconds
                        } else {
                            parsed.wait_duration_secs
                        };
                        return Decision::Retry {
                            wait_secs: wait,
                            mark_key_failed: false,
                        };
                    }
                    // this step's budget is spent; advance to the next step
                    // in the chain and re-evaluate without recursing.
                    step_index += 1;
                    continue;
                }
                FailoverAction::Failover => {
                    drop(attempts);
                    self.attempt_counters.remove(&counter_key);
                    return Decision::FailoverKey {
                        mark_key_failed: true,
                        deprioritize_key: is_quota_related(&parsed.subtype),
                    };
                }
                FailoverAction::Suspend => {
                    return Decision::SuspendChannel {
                        reason: if parsed.subtype.is_empty() {
                            parsed.status_code.to_string()
                        } else {
                            parsed.subtype.clone()
                        },
                    };
                }
                FailoverAction::ReturnError => {
                    return Decision::None {
                        reason: "return_error".to_string(),
                    };
                }
            }
        }
    }
}

fn step(action: FailoverAction, wait_seconds: u64, max_attempts: u32) -> ActionStep {
    ActionStep { action, wait_seconds, max_attempts }
}

fn rule(error_codes: &str, action_chain: Vec<ActionStep>) -> FailoverRule {
    FailoverRule { error_codes: error_codes.to_string(), action_chain }
}

/// The rule set applied when no configuration overrides it.
pub fn default_rules() -> Vec<FailoverRule> {
    vec![
        rule("429:QUOTA_EXHAUSTED", vec![step(FailoverAction::Suspend, 0, 1)]),
        rule("403:CREDIT_EXHAUSTED", vec![step(FailoverAction::Suspend, 0, 1)]),
        rule(
            "429:model_cooldown",
            vec![
                step(FailoverAction::Retry, 0, 99),
                step(FailoverAction::Failover, 0, 1),
            ],
        ),
        rule(
            "429:RESOURCE_EXHAUSTED",
            vec![
                step(FailoverAction::Retry, 20, 99),
                step(FailoverAction::Failover, 0, 1),
            ],
        ),
        rule(
            "429",
            vec![
                step(FailoverAction::Retry, 5, 3),
                step(FailoverAction::Failover, 0, 1),
            ],
        ),
        rule("401", vec![step(FailoverAction::Failover, 0, 1)]),
        rule("403", vec![step(FailoverAction::Failover, 0, 1)]),
        rule(
            "500,502,503,504",
            vec![
                step(FailoverAction::Retry, 5, 2),
                step(FailoverAction::Failover, 0, 1),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::ParsedError;

    fn parsed(status: u16, subtype: &str, wait: u64) -> ParsedError {
        ParsedError {
            status_code: status,
            subtype: subtype.to_string(),
            wait_duration_secs: wait,
            reset_seconds: None,
        }
    }

    #[test]
    fn exact_match_beats_status_only_and_others() {
        let engine = FailoverEngine::new(vec![
            rule("429", vec![step(FailoverAction::Failover, 0, 1)]),
            rule("429:model_cooldown", vec![step(FailoverAction::Suspend, 0, 1)]),
            rule("others", vec![step(FailoverAction::ReturnError, 0, 1)]),
        ]);
        let decision = engine.decide("c1", "k1", &parsed(429, "model_cooldown", 5));
        assert!(matches!(decision, Decision::SuspendChannel { .. }));
    }

    #[test]
    fn no_matching_rule_returns_none_with_reason() {
        let engine = FailoverEngine::new(vec![]);
        let decision = engine.decide("c1", "k1", &parsed(418, "", 0));
        match decision {
            Decision::None { reason } => assert_eq!(reason, "no_matching_rule"),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn default_resource_exhausted_retries_then_fails_over() {
        let engine = FailoverEngine::with_default_rules();
        let p = parsed(429, "RESOURCE_EXHAUSTED", 20);
        for _ in 0..99 {
            let decision = engine.decide("c1", "k1", &p);
            assert!(matches!(decision, Decision::Retry { wait_secs: 20, mark_key_failed: false }));
        }
        let decision = engine.decide("c1", "k1", &p);
        assert!(matches!(decision, Decision::FailoverKey { mark_key_failed: true, deprioritize_key: true }));
    }

    #[test]
    fn default_generic_429_retries_three_times_then_fails_over() {
        let engine = FailoverEngine::with_default_rules();
        let p = parsed(429, "", 0);
        for _ in 0..3 {
            let decision = engine.decide("c1", "k1", &p);
            assert!(matches!(decision, Decision::Retry { wait_secs: 5, .. }));
        }
        let decision = engine.decide("c1", "k1", &p);
        assert!(matches!(decision, Decision::FailoverKey { .. }));
    }

    #[test]
    fn default_401_is_immediate_failover() {
        let engine = FailoverEngine::with_default_rules();
        let decision = engine.decide("c1", "k1", &parsed(401, "", 0));
        assert!(matches!(decision, Decision::FailoverKey { mark_key_failed: true, .. }));
    }

    #[test]
    fn reset_on_success_clears_counters_for_pair() {
        let engine = FailoverEngine::with_default_rules();
        let p = parsed(429, "", 0);
        engine.decide("c1", "k1", &p);
        engine.reset_on_success("c1", "k1");
        // after reset, the retry counter restarts from zero.
        let decision = engine.decide("c1", "k1", &p);
        assert!(matches!(decision, Decision::Retry { .. }));
    }

    #[test]
    fn quota_related_failover_deprioritizes_key() {
        let engine = FailoverEngine::new(vec![rule(
            "429:QUOTA_EXHAUSTED",
            vec![step(FailoverAction::Failover, 0, 1)],
        )]);
        let decision = engine.decide("c1", "k1", &parsed(429, "QUOTA_EXHAUSTED", 0));
        assert!(matches!(decision, Decision::FailoverKey { deprioritize_key: true, .. }));
    }
}
