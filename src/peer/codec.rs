use crate::error::SignalError;
use crate::peer::types::{IceCandidate, SessionDescriptor, SignalingPayload};
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Leading marker of every encoded payload; bump on incompatible changes.
pub const PAYLOAD_VERSION: &str = "ssc1:";

/// Decompressed payloads above this size are rejected (zip-bomb guard)
const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

/// JSON -> gzip -> base64, prefixed with the version marker
pub fn encode(payload: &SignalingPayload) -> Result<String, SignalError> {
    let json = serde_json::to_vec(payload).map_err(|e| SignalError::Encode(e.to_string()))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|e| SignalError::Encode(e.to_string()))?;
    let compressed = gz.finish().map_err(|e| SignalError::Encode(e.to_string()))?;

    Ok(format!(
        "{PAYLOAD_VERSION}{}",
        general_purpose::STANDARD.encode(compressed)
    ))
}

/// Convenience for callers that only hold a descriptor and its candidates.
pub fn encode_parts(
    id: &str,
    descriptor: &SessionDescriptor,
    candidates: &[IceCandidate],
) -> Result<String, SignalError> {
    encode(&SignalingPayload::new(
        id,
        descriptor.clone(),
        candidates.to_vec(),
    ))
}

/// Inverse of [`encode`]. Whitespace anywhere in `text` is ignored.
pub fn decode(text: &str) -> Result<SignalingPayload, SignalError> {
    let cleaned = strip_whitespace(text);
    if cleaned.is_empty() {
        return Err(malformed("empty payload"));
    }

    let body = cleaned.strip_prefix(PAYLOAD_VERSION).ok_or_else(|| {
        match cleaned.split_once(':') {
            Some((version, _)) => malformed(format!("unsupported payload version `{version}`")),
            None => malformed("missing payload version marker"),
        }
    })?;

    let compressed = general_purpose::STANDARD
        .decode(body)
        .map_err(|e| malformed(format!("invalid base64: {e}")))?;

    let gz = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    gz.take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut json)
        .map_err(|e| malformed(format!("invalid gzip stream: {e}")))?;
    if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(malformed("payload exceeds 256 KiB when decompressed"));
    }

    serde_json::from_slice(&json).map_err(|e| malformed(format!("invalid payload json: {e}")))
}

pub(crate) fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn malformed(reason: impl Into<String>) -> SignalError {
    SignalError::MalformedPayload(reason.into())
}
