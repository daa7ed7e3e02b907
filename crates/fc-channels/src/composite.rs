//! Composite channel resolution.
//!
//! Pure function over a pool snapshot; owns no shared mutable state.

use fc_common::Channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target_id: Option<String>,
    pub target_index: Option<usize>,
    pub effective_model: String,
    pub found: bool,
}

/// Resolves `composite` + `requested_model` against `pool_snapshot` (the
/// concrete channels in the same pool, in current index order).
pub fn resolve(composite: &Channel, requested_model: &str, pool_snapshot: &[Channel]) -> ResolvedTarget {
    let mappings = match &composite.composite_mappings {
        Some(m) => m,
        None => {
            return ResolvedTarget {
                target_id: None,
                target_index: None,
                effective_model: requested_model.to_string(),
                found: false,
            }
        }
    };

    // 1. exact pattern match wins.
    let exact = mappings.iter().find(|m| m.pattern == requested_model);

    // 2. else longest contained pattern wins.
    let contained = mappings
        .iter()
        .filter(|m| requested_model.contains(m.pattern.as_str()))
        .max_by_key(|m| m.pattern.len());

    // 3. defensive wildcard fallback (forbidden by validation, kept for safety).
    let wildcard = mappings.iter().find(|m| m.pattern == "*");

    let chosen = exact.or(contained).or(wildcard);

    let Some(mapping) = chosen else {
        return ResolvedTarget {
            target_id: None,
            target_index: None,
            effective_model: requested_model.to_string(),
            found: false,
        };
    };

    let effective_model = mapping.target_model.clone().unwrap_or_else(|| requested_model.to_string());

    if let Some(id) = &mapping.target_channel_id {
        if let Some(idx) = pool_snapshot.iter().position(|c| &c.id == id) {
            return ResolvedTarget {
                target_id: Some(id.clone()),
                target_index: Some(idx),
                effective_model,
                found: true,
            };
        }
    }

    if let Some(idx) = mapping.target_channel {
        if let Some(c) = pool_snapshot.get(idx) {
            return ResolvedTarget {
                target_id: Some(c.id.clone()),
                target_index: Some(idx),
                effective_model,
                found: true,
            };
        }
    }

    ResolvedTarget {
        target_id: None,
        target_index: None,
        effective_model,
        found: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::{ChannelStatus, CompositeMapping, ServiceType};

    fn concrete(id: &str, name: &str) -> Channel {
        Channel {
            id: id.to_string(),
            index: None,
            name: name.to_string(),
            service_type: ServiceType::Claude,
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

    fn composite_with(mappings: Vec<(&str, &str)>) -> Channel {
        let mut c = concrete("composite-id", "Composite");
        c.service_type = ServiceType::Composite;
        c.composite_mappings = Some(
            mappings
                .into_iter()
                .map(|(pattern, target_id)| fc_common::CompositeMapping {
                    pattern: pattern.to_string(),
                    target_channel_id: Some(target_id.to_string()),
                    target_channel: None,
                    target_model: None,
                })
                .collect(),
        );
        c
    }

    #[test]
    fn exact_match_beats_contained_prefix() {
        let a = concrete("a", "A");
        let b = concrete("b", "B");
        let c = concrete("c", "C");
        let pool = vec![a, b, c];
        let composite = composite_with(vec![("haiku", "a"), ("sonnet", "b"), ("opus", "c")]);

        let resolved = resolve(&composite, "claude-3-5-sonnet-20241022", &pool);
        assert_eq!(resolved.target_id.as_deref(), Some("b"));

        let resolved_exact = resolve(&composite, "haiku", &pool);
        assert_eq!(resolved_exact.target_id.as_deref(), Some("a"));
    }

    #[test]
    fn unresolvable_model_is_not_found() {
        let pool = vec![concrete("a", "A")];
        let composite = composite_with(vec![("haiku", "a")]);
        let resolved = resolve(&composite, "gpt-4", &pool);
        assert!(!resolved.found);
    }

    #[test]
    fn target_model_override_wins() {
        let pool = vec![concrete("a", "A")];
        let mut composite = composite_with(vec![("haiku", "a")]);
        composite.composite_mappings.as_mut().unwrap()[0].target_model = Some("claude-haiku-override".into());
        let resolved = resolve(&composite, "haiku", &pool);
        assert_eq!(resolved.effective_model, "claude-haiku-override");
    }
}
