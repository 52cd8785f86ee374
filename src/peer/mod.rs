pub mod codec;
pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod loopback;
pub mod rtc;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{Callbacks, Session};
pub use data_channel::{Frame, Inbound, MessageChannel};
pub use ice::{CandidateSummary, GatherPhase, IceGatherer};
pub use loopback::LoopbackNetwork;
pub use rtc::{probe_ice_server, RtcTransportFactory};
pub use state::SessionState;
pub use transport::{Transport, TransportError, TransportEvent, TransportFactory};
pub use types::{DescriptorKind, IceCandidate, Role, SessionDescriptor, SignalingPayload};
