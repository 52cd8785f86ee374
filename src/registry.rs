use crate::error::SignalError;
use crate::peer::connection::Session;
use crate::peer::types::Role;
use crate::signaler::Signaler;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub type PeersHook = Arc<dyn Fn(&[String]) + Send + Sync>;

#[derive(Default)]
struct Peers {
    sessions: HashMap<String, Session>,
    /// ids whose session is still being created
    pending: HashSet<String>,
}

struct RegistryInner {
    signaler: Signaler,
    peers: Mutex<Peers>,
    on_peers_changed: Mutex<Option<PeersHook>>,
}

/// Host side: many independent sessions keyed by peer id.
///
/// Entries leave the registry on their own when the session reaches
/// `CLOSED` or `FAILED`; the application never removes them directly.
#[derive(Clone)]
pub struct HostRegistry {
    inner: Arc<RegistryInner>,
}

impl HostRegistry {
    pub fn new(signaler: Signaler) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                signaler,
                peers: Mutex::new(Peers::default()),
                on_peers_changed: Mutex::new(None),
            }),
        }
    }

    /// Called with the sorted peer ids after every insert or eviction.
    pub fn on_peers_changed(&self, f: impl Fn(&[String]) + Send + Sync + 'static) {
        *self.inner.on_peers_changed.lock() = Some(Arc::new(f));
    }

    pub async fn create_peer(&self, id: &str) -> Result<Session, SignalError> {
        {
            let mut peers = self.inner.peers.lock();
            let live = peers
                .sessions
                .get(id)
                .is_some_and(|s| !s.state().is_terminal());
            if live || peers.pending.contains(id) {
                return Err(SignalError::DuplicateId(id.to_string()));
            }
            peers.pending.insert(id.to_string());
        }
        // released on every exit, including the caller dropping this future
        let mut reservation = Reservation {
            inner: &self.inner,
            id,
            held: true,
        };

        let session =
            Session::create(&self.inner.signaler, Role::Host, Some(id.to_string())).await?;

        {
            let mut peers = self.inner.peers.lock();
            peers.pending.remove(id);
            peers.sessions.insert(id.to_string(), session.clone());
            reservation.held = false;
        }

        let registry = Arc::downgrade(&self.inner);
        let peer_id = id.to_string();
        session.on_state_change(move |s, state| {
            if state.is_terminal() {
                evict(&registry, &peer_id, s.id());
            }
        });
        // it may have died before the hook was in place
        if session.state().is_terminal() {
            evict(&Arc::downgrade(&self.inner), id, session.id());
        } else {
            info!(peer = id, session = session.id(), "peer registered");
            self.notify();
        }
        Ok(session)
    }

    pub async fn accept_for_peer(&self, id: &str, payload: &str) -> Result<(), SignalError> {
        self.session(id)?.accept_remote(payload).await
    }

    /// Waits for the answer payload after `accept_for_peer`.
    pub async fn answer_for_peer(&self, id: &str) -> Result<String, SignalError> {
        self.session(id)?.local_payload().await
    }

    pub async fn send_to_peer(&self, id: &str, data: impl Into<Bytes>) -> Result<(), SignalError> {
        self.session(id)?.send(data).await
    }

    /// Sends to every open peer; returns how many accepted the message.
    pub async fn broadcast(&self, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        let open: Vec<Session> = self
            .inner
            .peers
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect();

        let mut delivered = 0;
        for session in open {
            match session.send(data.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(session = session.id(), error = %err, "broadcast skipped peer"),
            }
        }
        delivered
    }

    /// Closes the peer's session; eviction follows from the state change.
    pub async fn disconnect_peer(&self, id: &str) -> Result<(), SignalError> {
        self.session(id)?.close().await;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.peers.lock().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.peers.lock().sessions.contains_key(id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        sorted_ids(&self.inner.peers.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.peers.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self.inner.peers.lock().sessions.values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
    }

    fn session(&self, id: &str) -> Result<Session, SignalError> {
        self.get(id)
            .ok_or_else(|| SignalError::UnknownPeer(id.to_string()))
    }

    fn notify(&self) {
        notify(&self.inner);
    }
}

/// An id claimed in `pending` while its session is being created.
struct Reservation<'a> {
    inner: &'a RegistryInner,
    id: &'a str,
    held: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.inner.peers.lock().pending.remove(self.id);
            debug!(peer = self.id, "reservation released");
        }
    }
}

fn sorted_ids(peers: &Peers) -> Vec<String> {
    let mut ids: Vec<String> = peers.sessions.keys().cloned().collect();
    ids.sort();
    ids
}

fn notify(inner: &RegistryInner) {
    let ids = sorted_ids(&inner.peers.lock());
    let hook = inner.on_peers_changed.lock().clone();
    if let Some(hook) = hook {
        hook(&ids);
    }
}

/// Removes `peer_id` only if it still maps to `session_id`; a newer session
/// registered under the same id is left alone.
fn evict(registry: &Weak<RegistryInner>, peer_id: &str, session_id: &str) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let removed = {
        let mut peers = inner.peers.lock();
        let matches = peers
            .sessions
            .get(peer_id)
            .is_some_and(|s| s.id() == session_id);
        if matches {
            peers.sessions.remove(peer_id);
        }
        matches
    };
    if removed {
        info!(peer = peer_id, session = session_id, "peer removed");
        notify(&inner);
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("peers", &self.peer_ids())
            .finish()
    }
}
