//! Pure, synchronous mutation logic over a [`GatewayDocument`].
//!
//! Both backends (file, database) share this module so the state-level
//! semantics are implemented exactly once; each backend only
//! differs in how the result is persisted.

use crate::document::GatewayDocument;
use crate::error::{ChannelStoreError, Result};
use chrono::{DateTime, Utc};
use fc_common::{Channel, ChannelStatus, CompositeMapping, PoolKind, ServiceType};

/// Partial update applied by `Update`; `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct ChannelPatch {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_keys: Option<Vec<String>>,
    pub oauth_tokens: Option<fc_common::OauthTokens>,
    pub model_mapping: Option<std::collections::BTreeMap<String, String>>,
    pub priority: Option<u32>,
    pub status: Option<ChannelStatus>,
    pub quota: Option<fc_common::Quota>,
    pub rate_limit_rpm: Option<Option<u32>>,
    pub key_load_balance: Option<Option<fc_common::LoadBalanceStrategy>>,
    pub content_filter: Option<Option<fc_common::ContentFilter>>,
    pub composite_mappings: Option<Vec<CompositeMapping>>,
    pub price_multipliers: Option<std::collections::BTreeMap<String, f64>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateOutcome {
    pub should_reset_metrics: bool,
}

pub fn get_all(doc: &GatewayDocument, kind: PoolKind) -> Vec<Channel> {
    doc.pool(kind)
        .channels
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            let mut c = c.clone();
            c.index = Some(idx);
            c
        })
        .collect()
}

pub fn get_current(doc: &GatewayDocument, kind: PoolKind) -> Result<Channel> {
    let pool = doc.pool(kind);
    if pool.channels.is_empty() {
        return Err(ChannelStoreError::NoChannels);
    }
    let chosen = pool
        .channels
        .iter()
        .position(|c| c.status == ChannelStatus::Active)
        .unwrap_or(0);
    let mut c = pool.channels[chosen].clone();
    c.index = Some(chosen);
    Ok(c)
}

pub fn add(doc: &mut GatewayDocument, kind: PoolKind, mut channel: Channel) -> Result<Channel> {
    let name = channel.name.trim().to_string();
    if name.is_empty() {
        return Err(ChannelStoreError::Validation("channel name must not be empty".into()));
    }
    channel.name = name;
    if doc.name_in_use(&channel.name, None) {
        return Err(ChannelStoreError::DuplicateName(channel.name));
    }
    if channel.id.trim().is_empty() || channel.id.starts_with("__invalid_") {
        channel.id = fc_common::generate_channel_id();
    }
    if channel.status == ChannelStatus::Active && !channel.name.is_empty() {
        // status defaults to active unless explicitly set otherwise by caller
    }
    if channel.service_type == ServiceType::Composite {
        validate_composite_mappings(doc, kind, &channel)?;
        channel.base_url = String::new();
        channel.api_keys.clear();
    } else if !channel.has_usable_credential() && channel.status == ChannelStatus::Active {
        channel.status = ChannelStatus::Suspended;
    }
    doc.pool_mut(kind).channels.push(channel.clone());
    channel.index = Some(doc.pool(kind).channels.len() - 1);
    touch(doc);
    Ok(channel)
}

pub fn update(
    doc: &mut GatewayDocument,
    kind: PoolKind,
    index: usize,
    patch: ChannelPatch,
) -> Result<UpdateOutcome> {
    let len = doc.pool(kind).channels.len();
    if index >= len {
        return Err(ChannelStoreError::IndexNotFound(index));
    }

    let mut outcome = UpdateOutcome::default();

    if let Some(name) = &patch.name {
        let trimmed = name.trim().to_string();
        if doc.name_in_use(&trimmed, Some((kind, index))) {
            return Err(ChannelStoreError::DuplicateName(trimmed));
        }
    }

    let previous_single_key = {
        let c = &doc.pool(kind).channels[index];
        (c.api_keys.len() == 1).then(|| c.api_keys[0].clone())
    };
    let previous_oauth_token = doc.pool(kind).channels[index]
        .oauth_tokens
        .as_ref()
        .and_then(|t| t.access_token.clone());

    let channel = &mut doc.pool_mut(kind).channels[index];
    if let Some(name) = patch.name {
        channel.name = name.trim().to_string();
    }
    if let Some(base_url) = patch.base_url {
        channel.base_url = base_url;
    }
    if let Some(keys) = patch.api_keys {
        channel.api_keys = keys;
    }
    if let Some(tokens) = patch.oauth_tokens {
        channel.oauth_tokens = Some(tokens);
    }
    if let Some(mapping) = patch.model_mapping {
        channel.model_mapping = mapping;
    }
    if let Some(priority) = patch.priority {
        channel.priority = priority;
    }
    if let Some(status) = patch.status {
        channel.status = status;
    }
    if let Some(quota) = patch.quota {
        channel.quota = Some(quota);
    }
    if let Some(rl) = patch.rate_limit_rpm {
        channel.rate_limit_rpm = rl;
    }
    if let Some(lb) = patch.key_load_balance {
        channel.key_load_balance = lb;
    }
    if let Some(cf) = patch.content_filter {
        channel.content_filter = cf;
    }
    if let Some(pm) = patch.price_multipliers {
        channel.price_multipliers = pm;
    }

    let new_single_key = (channel.api_keys.len() == 1).then(|| channel.api_keys[0].clone());
    if let (Some(prev), Some(new)) = (&previous_single_key, &new_single_key) {
        if prev != new {
            outcome.should_reset_metrics = true;
        }
    }

    let new_oauth_token = channel
        .oauth_tokens
        .as_ref()
        .and_then(|t| t.access_token.clone());
    if previous_oauth_token != new_oauth_token && new_oauth_token.is_some() {
        outcome.should_reset_metrics = true;
    }

    if outcome.should_reset_metrics && channel.status == ChannelStatus::Suspended {
        channel.status = ChannelStatus::Active;
    }

    if channel.status == ChannelStatus::Active && !channel.has_usable_credential() {
        channel.status = ChannelStatus::Suspended;
    }

    if let Some(mappings) = patch.composite_mappings {
        doc.pool_mut(kind).channels[index].composite_mappings = Some(mappings);
        let channel = doc.pool(kind).channels[index].clone();
        validate_composite_mappings(doc, kind, &channel)?;
    }

    touch(doc);
    Ok(outcome)
}

pub fn remove(doc: &mut GatewayDocument, kind: PoolKind, index: usize) -> Result<Channel> {
    let len = doc.pool(kind).channels.len();
    if index >= len {
        return Err(ChannelStoreError::IndexNotFound(index));
    }
    let removed = doc.pool_mut(kind).channels.remove(index);

    // Purge composite mappings that referenced the removed channel, and
    // shift legacy index-based references down.
    for pool_kind in PoolKind::ALL {
        let pool = doc.pool_mut(pool_kind);
        for channel in pool.channels.iter_mut() {
            if let Some(mappings) = &mut channel.composite_mappings {
                for m in mappings.iter_mut() {
                    if m.target_channel_id.as_deref() == Some(removed.id.as_str()) {
                        m.target_channel_id = None;
                        m.target_channel = None;
                    } else if let Some(ti) = m.target_channel {
                        if ti > index {
                            m.target_channel = Some(ti - 1);
                        }
                    }
                }
            }
        }
    }

    touch(doc);
    Ok(removed)
}

pub fn set_status(doc: &mut GatewayDocument, kind: PoolKind, index: usize, raw_status: &str) -> Result<()> {
    let status = ChannelStatus::parse(raw_status)
        .ok_or_else(|| ChannelStoreError::Validation(format!("invalid status '{raw_status}'")))?;
    let pool = doc.pool_mut(kind);
    let channel = pool
        .channels
        .get_mut(index)
        .ok_or(ChannelStoreError::IndexNotFound(index))?;
    channel.status = status;
    touch(doc);
    Ok(())
}

/// `duration` of `None` or non-positive clears promotion. At most one channel
/// per pool may be promoted; others are cleared first.
pub fn set_promotion(
    doc: &mut GatewayDocument,
    kind: PoolKind,
    index: usize,
    duration_secs: i64,
) -> Result<()> {
    let len = doc.pool(kind).channels.len();
    if index >= len {
        return Err(ChannelStoreError::IndexNotFound(index));
    }
    for c in doc.pool_mut(kind).channels.iter_mut() {
        c.promotion_until = None;
    }
    if duration_secs > 0 {
        let until = Utc::now() + chrono::Duration::seconds(duration_secs);
        doc.pool_mut(kind).channels[index].promotion_until = Some(until);
    }
    touch(doc);
    Ok(())
}

/// Partial reorder: only listed indices get their `priority` rewritten
/// (1-based). Unlisted channels keep their existing priority.
pub fn reorder(doc: &mut GatewayDocument, kind: PoolKind, index_list: &[usize]) -> Result<()> {
    let len = doc.pool(kind).channels.len();
    for &idx in index_list {
        if idx >= len {
            return Err(ChannelStoreError::IndexNotFound(idx));
        }
    }
    for (priority, &idx) in index_list.iter().enumerate() {
        doc.pool_mut(kind).channels[idx].priority = (priority + 1) as u32;
    }
    touch(doc);
    Ok(())
}

pub fn add_api_key(doc: &mut GatewayDocument, kind: PoolKind, index: usize, key: String) -> Result<()> {
    let channel = doc
        .pool_mut(kind)
        .channels
        .get_mut(index)
        .ok_or(ChannelStoreError::IndexNotFound(index))?;
    channel.api_keys.push(key);
    touch(doc);
    Ok(())
}

pub fn remove_api_key_by_index(
    doc: &mut GatewayDocument,
    kind: PoolKind,
    index: usize,
    key_index: usize,
) -> Result<()> {
    let channel = doc
        .pool_mut(kind)
        .channels
        .get_mut(index)
        .ok_or(ChannelStoreError::IndexNotFound(index))?;
    if key_index >= channel.api_keys.len() {
        return Err(ChannelStoreError::IndexNotFound(key_index));
    }
    channel.api_keys.remove(key_index);
    touch(doc);
    Ok(())
}

pub fn move_api_key_top_by_index(
    doc: &mut GatewayDocument,
    kind: PoolKind,
    index: usize,
    key_index: usize,
) -> Result<()> {
    let channel = doc
        .pool_mut(kind)
        .channels
        .get_mut(index)
        .ok_or(ChannelStoreError::IndexNotFound(index))?;
    if key_index >= channel.api_keys.len() {
        return Err(ChannelStoreError::IndexNotFound(key_index));
    }
    let key = channel.api_keys.remove(key_index);
    channel.api_keys.insert(0, key);
    touch(doc);
    Ok(())
}

pub fn move_api_key_bottom_by_index(
    doc: &mut GatewayDocument,
    kind: PoolKind,
    index: usize,
    key_index: usize,
) -> Result<()> {
    let channel = doc
        .pool_mut(kind)
        .channels
        .get_mut(index)
        .ok_or(ChannelStoreError::IndexNotFound(index))?;
    if key_index >= channel.api_keys.len() {
        return Err(ChannelStoreError::IndexNotFound(key_index));
    }
    let key = channel.api_keys.remove(key_index);
    channel.api_keys.push(key);
    touch(doc);
    Ok(())
}

/// Scans all pools for a literal key and moves it to the back of whichever
/// channel's list currently holds it (used after a quota-related failover).
pub fn deprioritize_api_key(doc: &mut GatewayDocument, key: &str) {
    let mut touched = false;
    for kind in PoolKind::ALL {
        for channel in doc.pool_mut(kind).channels.iter_mut() {
            if let Some(pos) = channel.api_keys.iter().position(|k| k == key) {
                if pos != channel.api_keys.len() - 1 {
                    let k = channel.api_keys.remove(pos);
                    channel.api_keys.push(k);
                    touched = true;
                }
            }
        }
    }
    if touched {
        touch(doc);
    }
}

pub fn set_debug_log_settings(doc: &mut GatewayDocument, settings: crate::document::DebugLogSettings) {
    doc.debug_log = settings;
    touch(doc);
}

pub fn set_failover_settings(doc: &mut GatewayDocument, settings: crate::document::FailoverSettings) {
    doc.failover = settings;
    touch(doc);
}

pub fn set_user_agent_settings(doc: &mut GatewayDocument, settings: crate::document::UserAgentSettings) {
    doc.user_agent = settings;
    touch(doc);
}

pub fn set_load_balance(doc: &mut GatewayDocument, kind: PoolKind, strategy: Option<fc_common::LoadBalanceStrategy>) {
    doc.pool_mut(kind).load_balance = strategy;
    touch(doc);
}

fn touch(doc: &mut GatewayDocument) {
    doc.updated_at = Some(Utc::now());
}

/// Validates that a composite channel has exactly three mappings
/// (haiku/sonnet/opus), no wildcard patterns, and every target resolves to a
/// non-composite, Claude-compatible channel in the same pool.
pub fn validate_composite_mappings(doc: &GatewayDocument, kind: PoolKind, channel: &Channel) -> Result<()> {
    let mappings = channel
        .composite_mappings
        .as_ref()
        .ok_or_else(|| ChannelStoreError::InvalidComposite("composite channel requires composite_mappings".into()))?;

    if mappings.len() != 3 {
        return Err(ChannelStoreError::InvalidComposite(
            "composite channel must declare exactly three mappings (haiku, sonnet, opus)".into(),
        ));
    }
    for m in mappings {
        if m.pattern.trim().is_empty() || m.pattern.trim() == "*" {
            return Err(ChannelStoreError::InvalidComposite(
                "wildcard or empty composite pattern is forbidden".into(),
            ));
        }
        let target = resolve_composite_target(doc, kind, m)?;
        if target.service_type == ServiceType::Composite {
            return Err(ChannelStoreError::InvalidComposite(
                "composite mapping target must not itself be composite".into(),
            ));
        }
        if !matches!(
            target.service_type,
            ServiceType::Claude | ServiceType::Openai | ServiceType::OpenaiChat | ServiceType::Openaiold
        ) {
            return Err(ChannelStoreError::InvalidComposite(
                "composite mapping target must be Claude-compatible".into(),
            ));
        }
    }
    Ok(())
}

fn resolve_composite_target<'a>(
    doc: &'a GatewayDocument,
    kind: PoolKind,
    mapping: &CompositeMapping,
) -> Result<&'a Channel> {
    if let Some(id) = &mapping.target_channel_id {
        return doc
            .pool(kind)
            .channels
            .iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| ChannelStoreError::InvalidComposite(format!("target channel id '{id}' not found")));
    }
    if let Some(idx) = mapping.target_channel {
        return doc
            .pool(kind)
            .channels
            .get(idx)
            .ok_or_else(|| ChannelStoreError::InvalidComposite(format!("legacy target index {idx} out of range")));
    }
    Err(ChannelStoreError::InvalidComposite(
        "composite mapping has neither target_channel_id nor target_channel".into(),
    ))
}

/// One-shot load-time migrations. Returns `true` if anything
/// was rewritten (caller must persist).
pub fn run_load_migrations(doc: &mut GatewayDocument) -> bool {
    let mut changed = false;

    for kind in PoolKind::ALL {
        let pool = doc.pool_mut(kind);
        for channel in pool.channels.iter_mut() {
            if channel.id.trim().is_empty() {
                channel.id = fc_common::generate_channel_id();
                changed = true;
            }
            if channel.status == ChannelStatus::Active && !channel.has_usable_credential() {
                channel.status = ChannelStatus::Suspended;
                changed = true;
            }
            if channel.service_type == ServiceType::OpenaiOauth {
                let has_token = channel
                    .oauth_tokens
                    .as_ref()
                    .map(|t| t.access_token.is_some())
                    .unwrap_or(false);
                if !has_token && channel.status == ChannelStatus::Active {
                    channel.status = ChannelStatus::Suspended;
                    changed = true;
                }
            }
        }
    }

    for rule in doc.failover.rules.iter_mut() {
        if rule.error_codes.eq_ignore_ascii_case("others") {
            let had_failover = rule
                .action_chain
                .iter()
                .any(|s| s.action == fc_common::FailoverAction::Failover);
            if had_failover {
                for step in rule.action_chain.iter_mut() {
                    if step.action == fc_common::FailoverAction::Failover {
                        step.action = fc_common::FailoverAction::ReturnError;
                    }
                }
                tracing::warn!("rewrote dangerous 'others'+failover rule to 'others'+return_error");
                changed = true;
            }
        }
    }

    if changed {
        touch(doc);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::{ChannelStatus, ServiceType};

    fn sample_channel(name: &str) -> Channel {
        Channel {
            id: String::new(),
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

    #[test]
    fn add_rejects_duplicate_case_insensitive_name() {
        let mut doc = GatewayDocument::default();
        add(&mut doc, PoolKind::Messages, sample_channel("Primary")).unwrap();
        let err = add(&mut doc, PoolKind::Messages, sample_channel("primary")).unwrap_err();
        assert!(matches!(err, ChannelStoreError::DuplicateName(_)));
    }

    #[test]
    fn add_generates_id_when_absent() {
        let mut doc = GatewayDocument::default();
        let c = add(&mut doc, PoolKind::Messages, sample_channel("A")).unwrap();
        assert_eq!(c.id.len(), 8);
    }

    #[test]
    fn add_without_credential_is_auto_suspended() {
        let mut doc = GatewayDocument::default();
        let mut c = sample_channel("NoKeys");
        c.api_keys.clear();
        let added = add(&mut doc, PoolKind::Messages, c).unwrap();
        assert_eq!(added.status, ChannelStatus::Suspended);
    }

    #[test]
    fn remove_reindexes_and_purges_composite_refs() {
        let mut doc = GatewayDocument::default();
        add(&mut doc, PoolKind::Messages, sample_channel("A")).unwrap();
        let b = add(&mut doc, PoolKind::Messages, sample_channel("B")).unwrap();
        let mut composite = sample_channel("C");
        composite.service_type = ServiceType::Composite;
        composite.composite_mappings = Some(vec![CompositeMapping {
            pattern: "haiku".into(),
            target_channel_id: Some(b.id.clone()),
            target_channel: None,
            target_model: None,
        }]);
        doc.pool_mut(PoolKind::Messages).channels.push(composite);

        remove(&mut doc, PoolKind::Messages, 0).unwrap();
        let remaining = get_all(&doc, PoolKind::Messages);
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].name, "B");
    }

    #[test]
    fn single_key_replacement_resets_metrics_and_reactivates() {
        let mut doc = GatewayDocument::default();
        add(&mut doc, PoolKind::Messages, sample_channel("A")).unwrap();
        set_status(&mut doc, PoolKind::Messages, 0, "suspended").unwrap();
        let outcome = update(
            &mut doc,
            PoolKind::Messages,
            0,
            ChannelPatch {
                api_keys: Some(vec!["sk-2".into()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(outcome.should_reset_metrics);
        assert_eq!(doc.messages.channels[0].status, ChannelStatus::Active);
    }

    #[test]
    fn update_clearing_keys_auto_suspends_active_channel() {
        let mut doc = GatewayDocument::default();
        add(&mut doc, PoolKind::Messages, sample_channel("A")).unwrap();
        let outcome = update(
            &mut doc,
            PoolKind::Messages,
            0,
            ChannelPatch {
                api_keys: Some(vec![]),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(doc.messages.channels[0].status, ChannelStatus::Suspended);
        assert!(!outcome.should_reset_metrics);
    }

    #[test]
    fn promotion_is_exclusive_per_pool() {
        let mut doc = GatewayDocument::default();
        add(&mut doc, PoolKind::Messages, sample_channel("A")).unwrap();
        add(&mut doc, PoolKind::Messages, sample_channel("B")).unwrap();
        set_promotion(&mut doc, PoolKind::Messages, 0, 60).unwrap();
        set_promotion(&mut doc, PoolKind::Messages, 1, 60).unwrap();
        assert!(doc.messages.channels[0].promotion_until.is_none());
        assert!(doc.messages.channels[1].promotion_until.is_some());
    }

    #[test]
    fn composite_requires_exactly_three_mappings() {
        let mut doc = GatewayDocument::default();
        let target = add(&mut doc, PoolKind::Messages, sample_channel("Target")).unwrap();
        let mut composite = sample_channel("Composite");
        composite.service_type = ServiceType::Composite;
        composite.composite_mappings = Some(vec![CompositeMapping {
            pattern: "haiku".into(),
            target_channel_id: Some(target.id.clone()),
            target_channel: None,
            target_model: None,
        }]);
        let err = add(&mut doc, PoolKind::Messages, composite).unwrap_err();
        assert!(matches!(err, ChannelStoreError::InvalidComposite(_)));
    }

    #[test]
    fn load_migration_rewrites_dangerous_others_failover_rule() {
        let mut doc = GatewayDocument::default();
        doc.failover.rules.push(fc_common::FailoverRule {
            error_codes: "others".into(),
            action_chain: vec![fc_common::ActionStep {
                action: fc_common::FailoverAction::Failover,
                wait_seconds: 0,
                max_attempts: 1,
            }],
        });
        let changed = run_load_migrations(&mut doc);
        assert!(changed);
        assert_eq!(
            doc.failover.rules[0].action_chain[0].action,
            fc_common::FailoverAction::ReturnError
        );
    }
}
