use crate::config::{IceServerKind, ServerConfig, SignalConfig};
use crate::peer::transport::{EventSender, Transport, TransportError, TransportEvent, TransportFactory};
use crate::peer::types::{DescriptorKind, IceCandidate, Role, SessionDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Opens real WebRTC peer connections.
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    config: Arc<SignalConfig>,
}

impl RtcTransportFactory {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn open(
        &self,
        role: Role,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = RtcTransport::new(&self.config, role, events).await?;
        Ok(Arc::new(transport))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: EventSender,
    config: Arc<SignalConfig>,
}

impl RtcTransport {
    async fn new(
        config: &Arc<SignalConfig>,
        role: Role,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);
        let channel = Arc::new(Mutex::new(None));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(error = %err, "unserializable local candidate dropped"),
                },
                // None marks the end of gathering
                None => {
                    let _ = tx.send(TransportEvent::GatheringComplete);
                }
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!(?state, "ice gathering state");
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!(state = ?st, "peer connection state");
            if st == RTCPeerConnectionState::Failed {
                let _ = tx.send(TransportEvent::Fatal("peer connection failed".into()));
            }
            Box::pin(async {})
        }));

        if role == Role::Host {
            let slot = channel.clone();
            let tx = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                attach_channel(&dc, &tx);
                *slot.lock() = Some(dc);
                Box::pin(async {})
            }));
        }

        Ok(Self {
            pc,
            channel,
            events,
            config: config.clone(),
        })
    }
}

/// Forwards a data channel's lifecycle and messages as transport events.
fn attach_channel(dc: &Arc<RTCDataChannel>, events: &EventSender) {
    let tx = events.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelOpen { label });
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg| {
        let _ = tx.send(TransportEvent::ChannelMessage(msg.data));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelClose);
        Box::pin(async {})
    }));
}

fn to_rtc(desc: &SessionDescriptor) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.body.clone();
    let rtc = match desc.kind {
        DescriptorKind::Offer => RTCSessionDescription::offer(sdp)?,
        DescriptorKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl Transport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescriptor::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescriptor::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let opts = &self.config.channel;
        let init = RTCDataChannelInit {
            ordered: Some(opts.ordered),
            max_retransmits: opts.max_retransmits,
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        attach_channel(&dc, &self.events);
        *self.channel.lock() = Some(dc);
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let dc = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| TransportError::new("no data channel"))?;
        dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) {
        let dc = self.channel.lock().take();
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close");
        }
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn ice_server(config: &ServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: vec![config.url_with_scheme()],
        username: config.username.clone().unwrap_or_default(),
        credential: config.credential.clone().unwrap_or_default(),
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers.iter().map(ice_server).collect()
}

/// Whether the candidate type proves `kind` of server is reachable.
fn proves(kind: IceServerKind, candidate: &IceCandidate) -> bool {
    match kind {
        IceServerKind::Stun => candidate.kind() == Some("srflx"),
        IceServerKind::Turn => candidate.kind() == Some("relay"),
    }
}

enum Probe {
    Candidate(IceCandidate),
    Done,
}

/// Gathers against a single server and reports whether it produced the
/// candidate type it is supposed to (srflx for STUN, relay for TURN).
pub async fn probe_ice_server(server: &ServerConfig, wait: Duration) -> bool {
    let url = server.url_with_scheme();
    info!(url = %url, kind = ?server.r#type, "probing ice server");

    let config = RTCConfiguration {
        ice_servers: vec![ice_server(server)],
        ..Default::default()
    };
    let api = APIBuilder::new().build();
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => pc,
        Err(err) => {
            warn!(error = %err, "failed to create peer connection for probe");
            return false;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let probe = match cand.map(|c| c.to_json()) {
            Some(Ok(init)) => Probe::Candidate(IceCandidate::new(init.candidate)),
            Some(Err(_)) => return Box::pin(async {}),
            None => Probe::Done,
        };
        let _ = tx.send(probe);
        Box::pin(async {})
    }));

    // a channel gives the offer something to gather for
    let started = async {
        pc.create_data_channel("probe", None).await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await
    };
    if let Err(err) = started.await {
        warn!(error = %err, "probe could not start gathering");
        let _ = pc.close().await;
        return false;
    }

    let kind = server.r#type;
    let found = timeout(wait, async {
        while let Some(probe) = rx.recv().await {
            match probe {
                Probe::Candidate(c) if proves(kind, &c) => return true,
                Probe::Candidate(c) => debug!(candidate = %c.candidate, "probe candidate ignored"),
                Probe::Done => return false,
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    let _ = pc.close().await;
    info!(url = %url, reachable = found, "probe finished");
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_get_their_scheme() {
        let turn = ServerConfig {
            id: "t".into(),
            r#type: IceServerKind::Turn,
            url: "turn.example.org:3478".into(),
            username: Some("u".into()),
            credential: Some("p".into()),
        };
        let servers = ice_servers(&[turn, ServerConfig::stun("s", "stun.example.org:3478")]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[1].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(servers[1].credential.is_empty());
    }

    #[test]
    fn probe_matches_candidate_type_to_server_kind() {
        let srflx = IceCandidate::new("candidate:1 1 udp 1686052607 203.0.113.7 5000 typ srflx raddr 10.0.0.2 rport 5000");
        let relay = IceCandidate::new("candidate:2 1 udp 41885439 198.51.100.1 6000 typ relay");
        assert!(proves(IceServerKind::Stun, &srflx));
        assert!(!proves(IceServerKind::Stun, &relay));
        assert!(proves(IceServerKind::Turn, &relay));
        assert!(!proves(IceServerKind::Turn, &srflx));
    }

    #[test]
    fn config_is_bundled() {
        let cfg = rtc_config(&[]);
        assert!(cfg.ice_servers.is_empty());
        assert_eq!(cfg.ice_candidate_pool_size, 10);
        assert_eq!(cfg.bundle_policy, RTCBundlePolicy::MaxBundle);
    }
}
