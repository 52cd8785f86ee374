#![allow(dead_code)]

use ssc_mesh::{HostRegistry, LoopbackNetwork, Role, Session, SessionState, SignalConfig, Signaler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config() -> SignalConfig {
    SignalConfig {
        logging_enabled: false,
        ..SignalConfig::localhost()
    }
}

pub fn signaler_with(net: &LoopbackNetwork, config: SignalConfig) -> Signaler {
    Signaler::new(Arc::new(net.clone()), config)
}

pub fn setup() -> (LoopbackNetwork, Signaler) {
    let net = LoopbackNetwork::new();
    let signaler = signaler_with(&net, config());
    (net, signaler)
}

pub async fn reach(session: &Session, state: SessionState) {
    timeout(WAIT, session.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}, still {}", session.state()))
        .unwrap_or_else(|e| panic!("never reached {state}: {e}"));
}

pub async fn payload_of(session: &Session) -> String {
    timeout(WAIT, session.local_payload())
        .await
        .expect("timed out waiting for payload")
        .expect("session died before producing a payload")
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Full exchange between a fresh peer session and registry entry `id`.
pub async fn connect(signaler: &Signaler, registry: &HostRegistry, id: &str) -> (Session, Session) {
    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    let host = registry.create_peer(id).await.unwrap();
    registry.accept_for_peer(id, &offer).await.unwrap();
    let answer = timeout(WAIT, registry.answer_for_peer(id))
        .await
        .expect("timed out waiting for answer")
        .unwrap();
    peer.accept_remote(&answer).await.unwrap();
    reach(&peer, SessionState::Open).await;
    reach(&host, SessionState::Open).await;
    (peer, host)
}
