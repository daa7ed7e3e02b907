//! Debug-log capture: compressed request/response bodies with sensitive
//! headers masked.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::read::GzDecoder;
use flate2::Compression;
use std::io::{Read, Write};

const SENSITIVE_HEADERS: [&str; 5] = ["authorization", "x-api-key", "cookie", "set-cookie", "proxy-authorization"];
const MASK: &str = "***REDACTED***";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct DebugLogEntry {
    pub request_id: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Wire shape returned over HTTP: the gzip-compressed `Vec<u8>` body columns
/// become base64 text so `serde_json` doesn't render them as integer arrays.
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct DebugLogEntryView {
    pub request_id: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: String,
    pub response_headers: Vec<(String, String)>,
    pub response_body: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DebugLogEntry {
    pub fn into_view(self) -> DebugLogEntryView {
        DebugLogEntryView {
            request_id: self.request_id,
            request_headers: self.request_headers,
            request_body: BASE64.encode(&self.request_body),
            response_headers: self.response_headers,
            response_body: BASE64.encode(&self.response_body),
            created_at: self.created_at,
        }
    }
}

/// Masks sensitive header values in place, case-insensitively by name.
pub fn mask_headers(headers: &mut [(String, String)]) {
    for (name, value) in headers.iter_mut() {
        if SENSITIVE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            *value = MASK.to_string();
        }
    }
}

/// Truncates to `max_body_size` bytes then gzip-compresses.
pub fn compress_body(body: &[u8], max_body_size: usize) -> std::io::Result<Vec<u8>> {
    let truncated = if body.len() > max_body_size { &body[..max_body_size] } else { body };
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(truncated)?;
    encoder.finish()
}

pub fn decompress_body(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_known_sensitive_headers_case_insensitively() {
        let mut headers = vec![
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("X-Api-Key".to_string(), "sk-abc".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        mask_headers(&mut headers);
        assert_eq!(headers[0].1, MASK);
        assert_eq!(headers[1].1, MASK);
        assert_eq!(headers[2].1, "application/json");
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let body = b"hello world, this is a debug log body";
        let compressed = compress_body(body, 1024).unwrap();
        let decompressed = decompress_body(&compressed).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn oversized_body_is_truncated_before_compression() {
        let body = vec![b'x'; 100];
        let compressed = compress_body(&body, 10).unwrap();
        let decompressed = decompress_body(&compressed).unwrap();
        assert_eq!(decompressed.len(), 10);
    }

    #[test]
    fn view_base64_encodes_body_columns() {
        let entry = DebugLogEntry {
            request_id: "req-1".to_string(),
            request_headers: vec![],
            request_body: compress_body(b"hello", 1024).unwrap(),
            response_headers: vec![],
            response_body: compress_body(b"world", 1024).unwrap(),
            created_at: chrono::Utc::now(),
        };
        let compressed_request_body = entry.request_body.clone();
        let view = entry.into_view();
        let decoded = base64::engine::general_purpose::STANDARD.decode(&view.request_body).unwrap();
        assert_eq!(decoded, compressed_request_body);
        assert_eq!(decompress_body(&decoded).unwrap(), b"hello");
    }
}
