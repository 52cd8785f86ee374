use crate::peer::types::{IceCandidate, Role, SessionDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Event reported by a transport. Delivered in order on one channel per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    /// end-of-candidates for the current local description
    GatheringComplete,
    ChannelOpen {
        label: String,
    },
    ChannelMessage(Bytes),
    ChannelClose,
    /// the transport gave up; the session cannot recover
    Fatal(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        Self(err.to_string())
    }
}

/// The narrow contract a session needs from the underlying peer connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError>;

    /// Starts local candidate gathering; results arrive as events.
    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Outbound channel; only the initiating side calls this.
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;

    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Builds one transport per session, wired to that session's event channel.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, role: Role, events: EventSender)
        -> Result<Arc<dyn Transport>, TransportError>;
}
