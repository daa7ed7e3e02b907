//! User-Agent capture/fallback.
//!
//! Pure matching/compare logic lives here so it can be unit tested without a
//! store; [`resolve`] is the only piece that touches [`ChannelStore`].

use std::sync::Arc;

use fc_channels::document::CapturedUserAgent;
use fc_channels::ChannelStore;
use fc_common::PoolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SemVer(u64, u64, u64);

fn parse_semver(s: &str) -> Option<SemVer> {
    let mut parts = s.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some(SemVer(major, minor, patch))
}

/// Extracts the version component from a `claude-cli/N.N.N ...` or
/// `codex_cli_rs/N.N.N ...` user-agent string, given its expected prefix.
fn extract_version<'a>(ua: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = ua.strip_prefix(prefix)?;
    let version_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
    let version = &rest[..version_end];
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// `true` if `candidate` both matches the expected prefix and is a strictly
/// newer semantic version than whatever is currently captured.
fn is_newer(candidate: &str, prefix: &str, current: Option<&str>) -> bool {
    let Some(candidate_version) = extract_version(candidate, prefix) else { return false };
    let Some(candidate_semver) = parse_semver(candidate_version) else { return false };
    match current.and_then(|c| extract_version(c, prefix)).and_then(parse_semver) {
        Some(current_semver) => candidate_semver > current_semver,
        None => true,
    }
}

/// Resolves the outbound User-Agent for one request, capturing and
/// persisting `client_ua` if it is a newer recognized client, and falling
/// back to the stored (or default) value otherwise.
pub async fn resolve(
    channels: &Arc<dyn ChannelStore>,
    pool: PoolKind,
    client_ua: Option<&str>,
    default_ua: &str,
) -> String {
    let prefix = match pool {
        PoolKind::Messages => "claude-cli/",
        PoolKind::Responses => "codex_cli_rs/",
        PoolKind::Gemini => return client_ua.map(str::to_string).unwrap_or_else(|| default_ua.to_string()),
    };

    let snapshot = match channels.snapshot().await {
        Ok(doc) => doc,
        Err(_) => return default_ua.to_string(),
    };
    let captured: &CapturedUserAgent = match pool {
        PoolKind::Messages => &snapshot.user_agent.messages,
        PoolKind::Responses => &snapshot.user_agent.responses,
        PoolKind::Gemini => unreachable!(),
    };

    if let Some(candidate) = client_ua {
        if is_newer(candidate, prefix, captured.latest.as_deref()) {
            let mut settings = snapshot.user_agent.clone();
            let entry = match pool {
                PoolKind::Messages => &mut settings.messages,
                PoolKind::Responses => &mut settings.responses,
                PoolKind::Gemini => unreachable!(),
            };
            entry.latest = Some(candidate.to_string());
            entry.last_captured_at = Some(chrono::Utc::now());
            if let Err(e) = channels.set_user_agent_settings(settings).await {
                tracing::warn!(error = %e, "failed to persist captured user-agent");
            }
            return candidate.to_string();
        }
    }

    captured.latest.clone().unwrap_or_else(|| default_ua.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_patch_version_is_captured() {
        assert!(is_newer("claude-cli/2.1.13 (external, cli)", "claude-cli/", Some("claude-cli/2.1.12 (external, cli)")));
    }

    #[test]
    fn older_version_is_rejected() {
        assert!(!is_newer("claude-cli/2.0.0", "claude-cli/", Some("claude-cli/2.1.12")));
    }

    #[test]
    fn non_matching_prefix_is_rejected() {
        assert!(!is_newer("curl/8.0.0", "claude-cli/", None));
    }

    #[test]
    fn first_observed_value_is_always_captured() {
        assert!(is_newer("claude-cli/1.0.0", "claude-cli/", None));
    }
}
