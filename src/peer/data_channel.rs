use crate::error::SignalError;
use crate::peer::connection::Session;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Frames of the optional naming subprotocol carried over the data channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// first frame: who is on the other end
    Intro { name: String },
    Msg { payload: Value },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Bytes, SignalError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SignalError::Encode(e.to_string()))
    }

    pub fn parse(data: &[u8]) -> Option<Frame> {
        serde_json::from_slice(data).ok()
    }
}

/// What the application receives for each inbound channel message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Introduced { name: String },
    Message { from: Option<String>, payload: Value },
    /// anything that is not a subprotocol frame, passed through untouched
    Raw(Bytes),
}

/// Per-session decoding state: remembers the name from the intro frame.
#[derive(Debug, Default)]
pub struct ChannelDecoder {
    name: Option<String>,
}

impl ChannelDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn decode(&mut self, data: &Bytes) -> Inbound {
        match Frame::parse(data) {
            Some(Frame::Intro { name }) => {
                self.name = Some(name.clone());
                Inbound::Introduced { name }
            }
            Some(Frame::Msg { payload }) => Inbound::Message {
                from: self.name.clone(),
                payload,
            },
            None => Inbound::Raw(data.clone()),
        }
    }
}

/// Subprotocol view over an open session.
#[derive(Clone)]
pub struct MessageChannel {
    session: Session,
    decoder: Arc<Mutex<ChannelDecoder>>,
}

impl MessageChannel {
    /// Decodes every inbound message of `session` and hands it to `handler`.
    pub fn attach(
        session: &Session,
        handler: impl Fn(&Session, Inbound) + Send + Sync + 'static,
    ) -> Self {
        let decoder = Arc::new(Mutex::new(ChannelDecoder::new()));
        let state = decoder.clone();
        session.on_message(move |s, data| {
            let inbound = state.lock().decode(data);
            if let Inbound::Raw(raw) = &inbound {
                debug!(session = s.id(), len = raw.len(), "non-frame message passed through");
            }
            handler(s, inbound);
        });
        Self {
            session: session.clone(),
            decoder,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Name the remote side introduced itself with
    pub fn remote_name(&self) -> Option<String> {
        self.decoder.lock().name().map(str::to_string)
    }

    pub async fn introduce(&self, name: &str) -> Result<(), SignalError> {
        let frame = Frame::Intro {
            name: name.to_string(),
        };
        self.session.send(frame.to_bytes()?).await
    }

    pub async fn send_msg(&self, payload: Value) -> Result<(), SignalError> {
        self.session.send(Frame::Msg { payload }.to_bytes()?).await
    }
}
