use crate::peer::transport::{EventSender, Transport, TransportError, TransportEvent, TransportFactory};
use crate::peer::types::{IceCandidate, Role, SessionDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Faults {
    reject_remote: bool,
    reject_candidates: bool,
    stall_gathering: bool,
    remote_delay: Option<Duration>,
}

struct Endpoint {
    role: Role,
    events: EventSender,
    local: Option<SessionDescriptor>,
    remote: Option<u64>,
    channel_label: Option<String>,
    applied: Vec<IceCandidate>,
    open: bool,
    closed: bool,
}

#[derive(Default)]
struct Net {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    peer_candidates: Option<Vec<IceCandidate>>,
    host_candidates: Option<Vec<IceCandidate>>,
    faults: Faults,
}

/// In-process stand-in for a real network.
///
/// Every session opened through it gets an endpoint; descriptors carry the
/// endpoint number in their `o=` line, so applying the other side's
/// descriptor links the two. The channel opens once both ends hold a local
/// and a remote description.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    net: Arc<Mutex<Net>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates every endpoint of `role` reports when gathering.
    /// Defaults to one host candidate per endpoint.
    pub fn set_candidates(&self, role: Role, candidates: Vec<IceCandidate>) {
        let mut net = self.net.lock();
        match role {
            Role::Peer => net.peer_candidates = Some(candidates),
            Role::Host => net.host_candidates = Some(candidates),
        }
    }

    pub fn reject_remote_descriptions(&self, on: bool) {
        self.net.lock().faults.reject_remote = on;
    }

    pub fn reject_candidates(&self, on: bool) {
        self.net.lock().faults.reject_candidates = on;
    }

    /// Never send end-of-candidates.
    pub fn stall_gathering(&self, on: bool) {
        self.net.lock().faults.stall_gathering = on;
    }

    pub fn delay_remote_descriptions(&self, delay: Duration) {
        self.net.lock().faults.remote_delay = Some(delay);
    }

    /// Endpoints whose transport has not been closed
    pub fn live_endpoints(&self) -> usize {
        self.net
            .lock()
            .endpoints
            .values()
            .filter(|e| !e.closed)
            .count()
    }

    /// Remote candidates applied on every endpoint, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        let net = self.net.lock();
        let mut ids: Vec<_> = net.endpoints.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .flat_map(|id| net.endpoints[id].applied.clone())
            .collect()
    }

    /// Reports a fatal transport fault on every live endpoint.
    pub fn fail_all(&self, reason: &str) {
        for endpoint in self.net.lock().endpoints.values().filter(|e| !e.closed) {
            let _ = endpoint
                .events
                .send(TransportEvent::Fatal(reason.to_string()));
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn open(
        &self,
        role: Role,
        events: EventSender,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let id = {
            let mut net = self.net.lock();
            net.next_id += 1;
            let id = net.next_id;
            net.endpoints.insert(
                id,
                Endpoint {
                    role,
                    events,
                    local: None,
                    remote: None,
                    channel_label: None,
                    applied: Vec::new(),
                    open: false,
                    closed: false,
                },
            );
            id
        };
        Ok(Arc::new(LoopbackTransport {
            id,
            net: self.net.clone(),
        }))
    }
}

pub struct LoopbackTransport {
    id: u64,
    net: Arc<Mutex<Net>>,
}

fn descriptor_body(id: u64, kind: &str) -> String {
    format!("v=0\r\no=- {id} 1 IN IP4 127.0.0.1\r\ns=loopback {kind}\r\nt=0 0\r\n")
}

fn endpoint_of(body: &str) -> Option<u64> {
    body.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

fn default_candidate(id: u64) -> IceCandidate {
    IceCandidate {
        candidate: format!(
            "candidate:lo{id} 1 udp 2130706431 127.0.0.1 {} typ host",
            50000 + id
        ),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

fn gone() -> TransportError {
    TransportError::new("endpoint closed")
}

impl LoopbackTransport {
    fn try_open(&self) {
        let mut net = self.net.lock();
        let Some(remote_id) = net.endpoints.get(&self.id).and_then(|e| e.remote) else {
            return;
        };
        let (Some(a), Some(b)) = (net.endpoints.get(&self.id), net.endpoints.get(&remote_id)) else {
            return;
        };
        let linked = b.remote == Some(self.id);
        let described = a.local.is_some() && b.local.is_some();
        let live = !a.open && !a.closed && !b.closed;
        let Some(label) = a.channel_label.clone().or_else(|| b.channel_label.clone()) else {
            return;
        };
        if !(linked && described && live) {
            return;
        }

        for id in [self.id, remote_id] {
            if let Some(endpoint) = net.endpoints.get_mut(&id) {
                endpoint.open = true;
                let _ = endpoint.events.send(TransportEvent::ChannelOpen {
                    label: label.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let net = self.net.lock();
        match net.endpoints.get(&self.id) {
            Some(e) if !e.closed => Ok(SessionDescriptor::offer(descriptor_body(self.id, "offer"))),
            _ => Err(gone()),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let net = self.net.lock();
        match net.endpoints.get(&self.id) {
            Some(e) if e.closed => Err(gone()),
            Some(e) if e.remote.is_some() => {
                Ok(SessionDescriptor::answer(descriptor_body(self.id, "answer")))
            }
            Some(_) => Err(TransportError::new("no remote offer to answer")),
            None => Err(gone()),
        }
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        let (events, candidates, stall) = {
            let mut guard = self.net.lock();
            let net = &mut *guard;
            let endpoint = net
                .endpoints
                .get_mut(&self.id)
                .filter(|e| !e.closed)
                .ok_or_else(gone)?;
            endpoint.local = Some(desc.clone());
            let configured = match endpoint.role {
                Role::Peer => net.peer_candidates.clone(),
                Role::Host => net.host_candidates.clone(),
            };
            (
                endpoint.events.clone(),
                configured.unwrap_or_else(|| vec![default_candidate(self.id)]),
                net.faults.stall_gathering,
            )
        };

        tokio::spawn(async move {
            for candidate in candidates {
                let _ = events.send(TransportEvent::LocalCandidate(candidate));
                tokio::task::yield_now().await;
            }
            if !stall {
                let _ = events.send(TransportEvent::GatheringComplete);
            }
        });
        self.try_open();
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        let faults = self.net.lock().faults.clone();
        if let Some(delay) = faults.remote_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.reject_remote {
            return Err(TransportError::new("remote description rejected"));
        }
        let remote = endpoint_of(&desc.body)
            .ok_or_else(|| TransportError::new("descriptor has no origin line"))?;
        {
            let mut net = self.net.lock();
            if remote == self.id || !net.endpoints.contains_key(&remote) {
                return Err(TransportError::new(format!(
                    "unknown remote endpoint {remote}"
                )));
            }
            let endpoint = net
                .endpoints
                .get_mut(&self.id)
                .filter(|e| !e.closed)
                .ok_or_else(gone)?;
            endpoint.remote = Some(remote);
        }
        self.try_open();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut guard = self.net.lock();
        let net = &mut *guard;
        let endpoint = net
            .endpoints
            .get_mut(&self.id)
            .filter(|e| !e.closed)
            .ok_or_else(gone)?;
        if endpoint.remote.is_none() {
            return Err(TransportError::new("remote description not set"));
        }
        if net.faults.reject_candidates {
            return Err(TransportError::new(format!(
                "candidate `{}` rejected",
                candidate.candidate
            )));
        }
        endpoint.applied.push(candidate.clone());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let mut net = self.net.lock();
        let endpoint = net
            .endpoints
            .get_mut(&self.id)
            .filter(|e| !e.closed)
            .ok_or_else(gone)?;
        endpoint.channel_label = Some(label.to_string());
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let net = self.net.lock();
        let endpoint = net
            .endpoints
            .get(&self.id)
            .filter(|e| e.open && !e.closed)
            .ok_or_else(|| TransportError::new("channel not open"))?;
        let remote = endpoint
            .remote
            .and_then(|id| net.endpoints.get(&id))
            .filter(|e| e.open && !e.closed)
            .ok_or_else(|| TransportError::new("remote side is gone"))?;
        remote
            .events
            .send(TransportEvent::ChannelMessage(data))
            .map_err(|_| TransportError::new("remote side is gone"))
    }

    async fn close(&self) {
        let mut net = self.net.lock();
        let Some(endpoint) = net.endpoints.get_mut(&self.id) else {
            return;
        };
        if endpoint.closed {
            return;
        }
        endpoint.closed = true;
        let was_open = std::mem::replace(&mut endpoint.open, false);
        let remote = endpoint.remote;

        if let Some(remote) = remote.filter(|_| was_open) {
            if let Some(other) = net.endpoints.get_mut(&remote) {
                if other.open && !other.closed {
                    other.open = false;
                    let _ = other.events.send(TransportEvent::ChannelClose);
                }
            }
        }

        let done: Vec<u64> = [Some(self.id), remote]
            .into_iter()
            .flatten()
            .filter(|id| net.finished(*id))
            .collect();
        for id in done {
            net.endpoints.remove(&id);
        }
    }
}

impl Net {
    /// Closed, and nothing live still points at it
    fn finished(&self, id: u64) -> bool {
        let Some(endpoint) = self.endpoints.get(&id) else {
            return false;
        };
        endpoint.closed
            && endpoint
                .remote
                .and_then(|r| self.endpoints.get(&r))
                .map_or(true, |other| other.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn origin_line_names_the_endpoint() {
        assert_eq!(endpoint_of(&descriptor_body(42, "offer")), Some(42));
        assert_eq!(endpoint_of("v=0\r\ns=-\r\n"), None);
        assert!(descriptor_body(1, "offer").starts_with("v=0"));
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let net = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = net.open(Role::Peer, tx).await.unwrap();
        let err = t
            .add_ice_candidate(&IceCandidate::new("candidate:x 1 udp 1 127.0.0.1 1 typ host"))
            .await
            .unwrap_err();
        assert!(err.0.contains("remote description"));
    }

    #[tokio::test]
    async fn gathering_reports_candidates_then_completion() {
        let net = LoopbackNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = net.open(Role::Peer, tx).await.unwrap();
        let offer = t.create_offer().await.unwrap();
        t.set_local_description(&offer).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::LocalCandidate(c) => assert_eq!(c.kind(), Some("host")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::GatheringComplete);
    }

    #[tokio::test]
    async fn closed_pairs_are_forgotten() {
        let net = LoopbackNetwork::new();
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let peer = net.open(Role::Peer, peer_tx).await.unwrap();
        let host = net.open(Role::Host, host_tx).await.unwrap();

        peer.create_data_channel("chat").await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        peer.set_local_description(&offer).await.unwrap();
        host.set_remote_description(&offer).await.unwrap();
        let answer = host.create_answer().await.unwrap();
        host.set_local_description(&answer).await.unwrap();
        peer.set_remote_description(&answer).await.unwrap();

        peer.close().await;
        assert_eq!(net.net.lock().endpoints.len(), 2, "host side is still live");
        host.close().await;
        assert!(net.net.lock().endpoints.is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        let lonely = net.open(Role::Peer, tx).await.unwrap();
        lonely.close().await;
        assert!(net.net.lock().endpoints.is_empty());
        assert_eq!(net.live_endpoints(), 0);
    }

    #[tokio::test]
    async fn self_reference_is_rejected() {
        let net = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t = net.open(Role::Peer, tx).await.unwrap();
        let offer = t.create_offer().await.unwrap();
        assert!(t.set_remote_description(&offer).await.is_err());
    }
}
