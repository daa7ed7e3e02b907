//! Upstream error classification.
//!
//! Turns a raw `(status_code, body)` pair into a provider-agnostic
//! [`fc_common::ParsedError`]. Providers speak slightly different JSON
//! shapes for the same underlying condition (quota exhaustion, rate limits,
//! credit exhaustion); this module is the single place that knows all of
//! them.

use fc_common::ParsedError;
use serde_json::Value;

const CREDIT_EXHAUSTED_PHRASES: [&str; 1] = ["quota is not enough"];

#[derive(Debug, Clone, Copy)]
pub struct ErrorParserConfig {
    pub generic_resource_wait_seconds: u64,
    pub model_cooldown_extra_seconds: u64,
    pub model_cooldown_max_wait_seconds: u64,
}

impl Default for ErrorParserConfig {
    fn default() -> Self {
        Self {
            generic_resource_wait_seconds: 20,
            model_cooldown_extra_seconds: 1,
            model_cooldown_max_wait_seconds: 60,
        }
    }
}

/// Parses an upstream error response. `body` is the raw response bytes,
/// best-effort-decoded as JSON; non-JSON bodies fall through to the
/// generic empty-subtype case for their status.
pub fn parse(status_code: u16, body: &str, config: &ErrorParserConfig) -> ParsedError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    match status_code {
        429 => parse_429(parsed.as_ref(), body, config),
        403 => parse_403(body),
        other => ParsedError {
            status_code: other,
            subtype: String::new(),
            wait_duration_secs: 0,
            reset_seconds: None,
        },
    }
}

fn parse_429(value: Option<&Value>, raw_body: &str, config: &ErrorParserConfig) -> ParsedError {
    let error = value.and_then(|v| v.get("error")).or(value);

    let status_field = error.and_then(|e| e.get("status")).and_then(Value::as_str);
    let code_field = error.and_then(|e| e.get("code")).and_then(Value::as_str);
    let reset_seconds = error
        .and_then(|e| e.get("reset_seconds").or_else(|| e.get("resetSeconds")))
        .and_then(Value::as_f64);

    let has_quota_exhausted_detail = error
        .and_then(|e| e.get("details"))
        .and_then(Value::as_array)
        .map(|details| {
            details
                .iter()
                .any(|d| d.get("reason").and_then(Value::as_str) == Some("QUOTA_EXHAUSTED"))
        })
        .unwrap_or(false);

    // priority 1: RESOURCE_EXHAUSTED status + QUOTA_EXHAUSTED detail, even if
    // a cooldown code is also present in the same payload.
    if status_field == Some("RESOURCE_EXHAUSTED") && has_quota_exhausted_detail {
        return ParsedError {
            status_code: 429,
            subtype: "QUOTA_EXHAUSTED".to_string(),
            wait_duration_secs: 0,
            reset_seconds,
        };
    }

    if code_field == Some("model_cooldown") {
        let base = reset_seconds.unwrap_or(2.0).ceil() as u64;
        let wait = (base + config.model_cooldown_extra_seconds).min(config.model_cooldown_max_wait_seconds);
        return ParsedError {
            status_code: 429,
            subtype: "model_cooldown".to_string(),
            wait_duration_secs: wait,
            reset_seconds,
        };
    }

    if status_field == Some("RESOURCE_EXHAUSTED") {
        return ParsedError {
            status_code: 429,
            subtype: "RESOURCE_EXHAUSTED".to_string(),
            wait_duration_secs: config.generic_resource_wait_seconds,
            reset_seconds,
        };
    }

    let _ = raw_body;
    ParsedError {
        status_code: 429,
        subtype: String::new(),
        wait_duration_secs: 0,
        reset_seconds,
    }
}

fn parse_403(body: &str) -> ParsedError {
    let lower = body.to_ascii_lowercase();
    let credit_exhausted = CREDIT_EXHAUSTED_PHRASES.iter().any(|p| lower.contains(p))
        || (lower.contains("insufficient") && lower.contains("quota"));

    ParsedError {
        status_code: 403,
        subtype: if credit_exhausted { "CREDIT_EXHAUSTED".to_string() } else { String::new() },
        wait_duration_secs: 0,
        reset_seconds: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exhausted_wins_even_with_cooldown_code() {
        let body = serde_json::json!({
            "error": {
                "status": "RESOURCE_EXHAUSTED",
                "code": "model_cooldown",
                "details": [{"reason": "QUOTA_EXHAUSTED"}]
            }
        })
        .to_string();
        let parsed = parse(429, &body, &ErrorParserConfig::default());
        assert_eq!(parsed.subtype, "QUOTA_EXHAUSTED");
    }

    #[test]
    fn model_cooldown_wait_is_ceiled_and_clamped() {
        let body = serde_json::json!({"error": {"code": "model_cooldown", "reset_seconds": 57.2}}).to_string();
        let parsed = parse(429, &body, &ErrorParserConfig::default());
        assert_eq!(parsed.subtype, "model_cooldown");
        assert_eq!(parsed.wait_duration_secs, 58);
    }

    #[test]
    fn model_cooldown_without_reset_seconds_defaults_to_two() {
        let body = serde_json::json!({"error": {"code": "model_cooldown"}}).to_string();
        let parsed = parse(429, &body, &ErrorParserConfig::default());
        assert_eq!(parsed.wait_duration_secs, 3);
    }

    #[test]
    fn model_cooldown_wait_clamps_to_configured_max() {
        let body = serde_json::json!({"error": {"code": "model_cooldown", "reset_seconds": 500.0}}).to_string();
        let parsed = parse(429, &body, &ErrorParserConfig::default());
        assert_eq!(parsed.wait_duration_secs, 60);
    }

    #[test]
    fn resource_exhausted_uses_generic_wait() {
        let body = serde_json::json!({"error": {"status": "RESOURCE_EXHAUSTED"}}).to_string();
        let parsed = parse(429, &body, &ErrorParserConfig::default());
        assert_eq!(parsed.subtype, "RESOURCE_EXHAUSTED");
        assert_eq!(parsed.wait_duration_secs, 20);
    }

    #[test]
    fn forbidden_with_quota_phrase_is_credit_exhausted() {
        let parsed = parse(403, "{\"error\": \"quota is not enough\"}", &ErrorParserConfig::default());
        assert_eq!(parsed.subtype, "CREDIT_EXHAUSTED");
    }

    #[test]
    fn forbidden_with_insufficient_and_quota_is_credit_exhausted() {
        let parsed = parse(403, "insufficient account quota", &ErrorParserConfig::default());
        assert_eq!(parsed.subtype, "CREDIT_EXHAUSTED");
    }

    #[test]
    fn unrelated_status_has_empty_subtype() {
        let parsed = parse(500, "internal error", &ErrorParserConfig::default());
        assert_eq!(parsed.subtype, "");
    }

    #[test]
    fn error_code_pattern_joins_status_and_subtype() {
        let parsed = parse(429, "{\"error\": {\"status\": \"RESOURCE_EXHAUSTED\"}}", &ErrorParserConfig::default());
        assert_eq!(parsed.error_code_pattern(), "429:RESOURCE_EXHAUSTED");
        let plain = parse(500, "x", &ErrorParserConfig::default());
        assert_eq!(plain.error_code_pattern(), "500");
    }
}
