pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod registry;
pub mod signaler;
pub mod utils;

pub use config::{ServerConfig, SignalConfig};
pub use error::{ConfigError, SignalError};
pub use logger::LogSink;
pub use peer::{
    Callbacks, DescriptorKind, IceCandidate, LoopbackNetwork, MessageChannel, Role, Session,
    SessionDescriptor, SessionState, SignalingPayload,
};
pub use registry::HostRegistry;
pub use signaler::Signaler;
