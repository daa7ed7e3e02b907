//! Candidate channel ordering: promotion window first, then priority order
//! (`0` sorts last, i.e. "use index order"), then index as the final
//! tiebreak.

use fc_common::Channel;
use std::cmp::Ordering;
use std::collections::HashSet;

pub fn ordered_candidates(channels: &[Channel]) -> Vec<Channel> {
    let now = chrono::Utc::now();
    let mut eligible: Vec<Channel> = channels
        .iter()
        .filter(|c| c.status.is_dispatch_eligible())
        .cloned()
        .collect();

    eligible.sort_by(|a, b| {
        let a_promoted = a.promotion_until.map(|t| t > now).unwrap_or(false);
        let b_promoted = b.promotion_until.map(|t| t > now).unwrap_or(false);
        if a_promoted != b_promoted {
            return if a_promoted { Ordering::Less } else { Ordering::Greater };
        }
        let a_priority = if a.priority == 0 { u32::MAX } else { a.priority };
        let b_priority = if b.priority == 0 { u32::MAX } else { b.priority };
        a_priority.cmp(&b_priority).then(a.index.cmp(&b.index))
    });

    eligible
}

/// First eligible channel not yet present in `tried` (by stable id).
pub fn next_candidate(channels: &[Channel], tried: &HashSet<String>) -> Option<Channel> {
    ordered_candidates(channels).into_iter().find(|c| !tried.contains(&c.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::{ChannelStatus, ServiceType};

    fn channel(id: &str, index: usize, priority: u32, status: ChannelStatus) -> Channel {
        Channel {
            id: id.to_string(),
            index: Some(index),
            name: id.to_string(),
            service_type: ServiceType::Claude,
            base_url: "https://example.test".into(),
            api_keys: vec!["sk-1".into()],
            oauth_tokens: None,
            model_mapping: Default::default(),
            priority,
            status,
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
    fn disabled_and_suspended_channels_are_excluded() {
        let channels = vec![
            channel("a", 0, 0, ChannelStatus::Disabled),
            channel("b", 1, 0, ChannelStatus::Suspended),
            channel("c", 2, 0, ChannelStatus::Active),
        ];
        let ordered = ordered_candidates(&channels);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, "c");
    }

    #[test]
    fn nonzero_priority_sorts_before_zero_priority() {
        let channels = vec![
            channel("a", 0, 0, ChannelStatus::Active),
            channel("b", 1, 2, ChannelStatus::Active),
            channel("c", 2, 1, ChannelStatus::Active),
        ];
        let ordered = ordered_candidates(&channels);
        let ids: Vec<&str> = ordered.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn promoted_channel_always_sorts_first() {
        let mut channels = vec![
            channel("a", 0, 1, ChannelStatus::Active),
            channel("b", 1, 2, ChannelStatus::Active),
        ];
        channels[1].promotion_until = Some(chrono::Utc::now() + chrono::Duration::seconds(60));
        let ordered = ordered_candidates(&channels);
        assert_eq!(ordered[0].id, "b");
    }

    #[test]
    fn next_candidate_skips_already_tried() {
        let channels = vec![
            channel("a", 0, 1, ChannelStatus::Active),
            channel("b", 1, 2, ChannelStatus::Active),
        ];
        let mut tried = HashSet::new();
        tried.insert("a".to_string());
        let next = next_candidate(&channels, &tried).unwrap();
        assert_eq!(next.id, "b");
    }
}
