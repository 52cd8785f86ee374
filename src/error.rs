use crate::peer::state::SessionState;
use crate::peer::types::DescriptorKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned to the caller of a signaling operation.
///
/// All of them are recoverable at the call site; only `DescriptorRejected`
/// (and transport faults reported through events) take a session to `FAILED`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("malformed signaling payload: {0}")]
    MalformedPayload(String),
    #[error("descriptor rejected by transport: {0}")]
    DescriptorRejected(String),
    #[error("candidate rejected by transport: {0}")]
    CandidateRejected(String),
    #[error("channel is not open")]
    ChannelNotOpen,
    #[error("peer `{0}` is already registered")]
    DuplicateId(String),
    #[error("unknown peer `{0}`")]
    UnknownPeer(String),
    #[error("session is busy applying a remote payload")]
    SessionBusy,
    #[error("expected an {expected} payload, got an {got}")]
    UnexpectedDescriptor {
        expected: DescriptorKind,
        got: DescriptorKind,
    },
    #[error("payload belongs to session {got}, this is session {expected}")]
    SessionMismatch { expected: String, got: String },
    #[error("operation not allowed in state {0}")]
    InvalidState(SessionState),
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
