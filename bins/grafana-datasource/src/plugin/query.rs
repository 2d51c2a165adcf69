use serde::Deserialize;
use stream_bridge::PayloadEncoding;

/// Leading channel path segments naming the payload encoding.
const JSON_SEGMENT: &str = "json";
const BASE64_SEGMENT: &str = "base64";

// ═══════════════════════════════════════════════════════════════
//  Query model
// ═══════════════════════════════════════════════════════════════

/// The query model sent from Grafana frontend.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RabbitMqQuery {
    #[serde(default)]
    pub are_messages_base64_encrypted: bool,
    /// Column hints from the query editor; the stream schema is inferred
    /// from payloads, so these are accepted and ignored.
    #[serde(default)]
    #[allow(dead_code)]
    pub json_query_models: Vec<serde_json::Value>,
}

impl RabbitMqQuery {
    pub fn encoding(&self) -> PayloadEncoding {
        if self.are_messages_base64_encrypted {
            PayloadEncoding::Base64Json
        } else {
            PayloadEncoding::Json
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Channel path
// ═══════════════════════════════════════════════════════════════

/// Live channel path for a stream: an encoding segment followed by the
/// sanitized stream name, e.g. `base64/metrics`.
pub(crate) fn channel_path(stream_name: &str, encoding: PayloadEncoding) -> String {
    let name: String = stream_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let segment = match encoding {
        PayloadEncoding::Json => JSON_SEGMENT,
        PayloadEncoding::Base64Json => BASE64_SEGMENT,
    };
    format!("{segment}/{name}")
}

/// Payload encoding recorded in a channel path by [`channel_path`].
/// Stream names may contain `/`, so only the first segment is read.
pub(crate) fn encoding_from_path(path: &str) -> PayloadEncoding {
    match path.split_once('/') {
        Some((BASE64_SEGMENT, _)) => PayloadEncoding::Base64Json,
        _ => PayloadEncoding::Json,
    }
}
