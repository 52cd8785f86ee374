use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the exchange a session plays
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// accepts one or more inbound sessions
    Host,
    /// initiates exactly one outbound session
    Peer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Peer => f.write_str("peer"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorKind::Offer => f.write_str("offer"),
            DescriptorKind::Answer => f.write_str("answer"),
        }
    }
}

/// Session description produced by the transport. Immutable once produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub kind: DescriptorKind,
    pub body: String,
}

impl SessionDescriptor {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            body: body.into(),
        }
    }
}

/// ICE candidate as the transport reports it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    /// `candidate:<foundation> <component> ...` → foundation
    pub fn foundation(&self) -> Option<&str> {
        self.candidate
            .split_whitespace()
            .next()
            .map(|first| first.strip_prefix("candidate:").unwrap_or(first))
            .filter(|f| !f.is_empty())
    }

    /// Value following `typ` (host, srflx, prflx, relay)
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

/// Descriptor plus the candidates gathered for it, as exchanged between operators.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalingPayload {
    #[serde(rename = "s")]
    pub descriptor: SessionDescriptor,
    #[serde(rename = "c", default)]
    pub candidates: Vec<IceCandidate>,
    /// originating session id; the answer carries the offer's id back
    pub id: String,
    pub ts: i64,
}

impl SignalingPayload {
    pub fn new(id: impl Into<String>, descriptor: SessionDescriptor, candidates: Vec<IceCandidate>) -> Self {
        Self {
            descriptor,
            candidates,
            id: id.into(),
            ts: chrono::Utc::now().timestamp(),
        }
    }
}
