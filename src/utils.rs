use crate::peer::codec::strip_whitespace;
use rand::Rng;
use sha2::{Digest, Sha256};

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Short fingerprint of a pasted payload, identical on both ends of the exchange.
/// 48 bits (12 hex chars) of SHA-256 over the whitespace-stripped text.
pub fn payload_fingerprint(text: &str) -> String {
    let digest = Sha256::digest(strip_whitespace(text).as_bytes());
    hex::encode(&digest[..6])
}

/// First eight characters of a session id, for log lines
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
