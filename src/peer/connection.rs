use crate::error::SignalError;
use crate::logger::LogSink;
use crate::peer::codec;
use crate::peer::ice::{CandidateSummary, GatherPhase, IceGatherer};
use crate::peer::state::SessionState;
use crate::peer::transport::{EventReceiver, EventSender, Transport, TransportError, TransportEvent};
use crate::peer::types::{DescriptorKind, Role, SessionDescriptor, SignalingPayload};
use crate::signaler::Signaler;
use crate::utils::{payload_fingerprint, random_id, short_id};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type SessionHook = Arc<dyn Fn(&Session) + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(&Session, &Bytes) + Send + Sync>;
pub type StateHook = Arc<dyn Fn(&Session, SessionState) + Send + Sync>;

/// Application callbacks shared by every session a [`Signaler`] creates.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_connect: Option<SessionHook>,
    on_message: Option<MessageHook>,
    on_disconnect: Option<SessionHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel reached `OPEN`.
    pub fn on_connect(mut self, f: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&Session, &Bytes) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// An open channel went away (closed or failed).
    pub fn on_disconnect(mut self, f: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }
}

#[derive(Default)]
struct Listeners {
    state: Vec<StateHook>,
    message: Vec<MessageHook>,
}

struct Core {
    transport: Option<Arc<dyn Transport>>,
    gatherer: IceGatherer,
    local_descriptor: Option<SessionDescriptor>,
    /// id stamped on the local payload; the host answers with the offer's id
    payload_id: String,
    /// channel opened before we reached CONNECTING (label to replay)
    pending_open: Option<String>,
    /// messages that arrived between channel-open and our own OPEN
    backlog: Vec<Bytes>,
}

struct Inner {
    id: String,
    role: Role,
    peer_id: Option<String>,
    state: watch::Sender<SessionState>,
    payload: watch::Sender<Option<String>>,
    core: Mutex<Core>,
    busy: AtomicBool,
    listeners: Mutex<Listeners>,
    callbacks: Callbacks,
    log: LogSink,
    gather_timeout: Option<Duration>,
    /// loops events back into our own pump
    wake: EventSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One peer-to-peer connection and its signaling lifecycle.
///
/// Cheap to clone; all clones refer to the same session. Every mutation goes
/// through the state machine in [`SessionState`], driven by transport events
/// handled on a single pump task plus the caller-driven `accept_remote`.
/// Expects a single-threaded runtime, the same one its [`LogSink`] flushes on.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Session {
    pub(crate) async fn create(
        signaler: &Signaler,
        role: Role,
        peer_id: Option<String>,
    ) -> Result<Session, SignalError> {
        let config = signaler.config();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = signaler
            .factory()
            .open(role, events_tx.clone())
            .await
            .map_err(|e| SignalError::Transport(e.to_string()))?;

        let id = random_id();
        let (state, _) = watch::channel(SessionState::New);
        let (payload, _) = watch::channel(None);
        let session = Session {
            inner: Arc::new(Inner {
                id: id.clone(),
                role,
                peer_id,
                state,
                payload,
                core: Mutex::new(Core {
                    transport: Some(transport.clone()),
                    gatherer: IceGatherer::new(),
                    local_descriptor: None,
                    payload_id: id,
                    pending_open: None,
                    backlog: Vec::new(),
                }),
                busy: AtomicBool::new(false),
                listeners: Mutex::new(Listeners::default()),
                callbacks: signaler.callbacks().clone(),
                log: signaler.log().clone(),
                gather_timeout: config.gather_timeout(),
                wake: events_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        session.spawn_pump(events_rx);
        if let Some(expiry) = config.session_expiry() {
            session.spawn_expiry(expiry);
        }
        session.log(format!("{role} session created"));
        session.advance(SessionState::GatheringLocal);

        match role {
            Role::Peer => {
                if let Err(e) = transport.create_data_channel(&config.channel.label).await {
                    let err = SignalError::Transport(e.to_string());
                    session.fail(&err.to_string()).await;
                    return Err(err);
                }
                let offer = match transport.create_offer().await {
                    Ok(offer) => offer,
                    Err(e) => return Err(session.reject(e).await),
                };
                session
                    .begin_gathering(GatherPhase::Offer, offer, &transport)
                    .await?;
            }
            Role::Host => {
                // nothing to gather until the remote offer shows up
                session.advance(SessionState::AwaitingRemote);
            }
        }
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Registry key for host-side sessions
    pub fn peer_id(&self) -> Option<&str> {
        self.inner.peer_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn on_state_change(&self, f: impl Fn(&Session, SessionState) + Send + Sync + 'static) {
        self.inner.listeners.lock().state.push(Arc::new(f));
    }

    pub fn on_message(&self, f: impl Fn(&Session, &Bytes) + Send + Sync + 'static) {
        self.inner.listeners.lock().message.push(Arc::new(f));
    }

    /// Payload of the current phase if it is ready
    pub fn try_local_payload(&self) -> Option<String> {
        self.inner.payload.borrow().clone()
    }

    /// Waits for the encoded payload of the current phase: the offer for a
    /// peer, the answer for a host (after `accept_remote`).
    pub async fn local_payload(&self) -> Result<String, SignalError> {
        let mut payload = self.inner.payload.subscribe();
        let mut state = self.inner.state.subscribe();
        loop {
            if let Some(text) = payload.borrow_and_update().clone() {
                return Ok(text);
            }
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return Err(SignalError::InvalidState(current));
            }
            let closed = tokio::select! {
                changed = payload.changed() => changed.is_err(),
                changed = state.changed() => changed.is_err(),
            };
            if closed {
                return Err(SignalError::InvalidState(self.state()));
            }
        }
    }

    /// Resolves once the session reaches `target`; fails if it ends elsewhere.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<(), SignalError> {
        let mut rx = self.inner.state.subscribe();
        let reached = rx
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| SignalError::InvalidState(self.state()))?;
        if reached == target {
            Ok(())
        } else {
            Err(SignalError::InvalidState(reached))
        }
    }

    /// Applies the remote side's payload: descriptor first, then its
    /// candidates in order. A host then produces its answer payload.
    pub async fn accept_remote(&self, text: &str) -> Result<(), SignalError> {
        let Some(_guard) = BusyGuard::acquire(&self.inner.busy) else {
            warn!(session = %self.short(), "remote payload rejected, another one is in flight");
            self.log("rejected remote payload: session busy");
            return Err(SignalError::SessionBusy);
        };

        let result = self.apply_remote(text).await;
        if let Err(err) = &result {
            warn!(session = %self.short(), error = %err, "remote payload not applied");
            self.log(format!("remote payload not applied: {err}"));
        }
        result
    }

    async fn apply_remote(&self, text: &str) -> Result<(), SignalError> {
        let state = self.state();
        if state != SessionState::AwaitingRemote {
            return Err(SignalError::InvalidState(state));
        }

        let payload = codec::decode(text)?;
        let expected = match self.inner.role {
            Role::Peer => DescriptorKind::Answer,
            Role::Host => DescriptorKind::Offer,
        };
        if payload.descriptor.kind != expected {
            return Err(SignalError::UnexpectedDescriptor {
                expected,
                got: payload.descriptor.kind,
            });
        }
        if self.inner.role == Role::Peer && payload.id != self.inner.id {
            return Err(SignalError::SessionMismatch {
                expected: self.inner.id.clone(),
                got: payload.id,
            });
        }
        let transport = self
            .transport()
            .ok_or_else(|| SignalError::InvalidState(self.state()))?;

        self.log(format!(
            "applying remote {} with {} candidates (fingerprint {})",
            payload.descriptor.kind,
            payload.candidates.len(),
            payload_fingerprint(text)
        ));
        if let Err(e) = transport.set_remote_description(&payload.descriptor).await {
            return Err(self.reject(e).await);
        }

        // candidates only ever after the remote descriptor is in place
        let mut applied = 0;
        for candidate in &payload.candidates {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    let err = SignalError::CandidateRejected(e.to_string());
                    warn!(session = %self.short(), candidate = %candidate.candidate, error = %err, "skipping remote candidate");
                    self.log(format!("skipping remote candidate: {err}"));
                }
            }
        }
        self.log(format!(
            "applied {applied}/{} remote candidates",
            payload.candidates.len()
        ));

        match self.inner.role {
            Role::Peer => {
                if self.enter_connecting() {
                    Ok(())
                } else {
                    Err(SignalError::InvalidState(self.state()))
                }
            }
            Role::Host => {
                self.inner.core.lock().payload_id = payload.id;
                if !self.advance(SessionState::GeneratingAnswer) {
                    return Err(SignalError::InvalidState(self.state()));
                }
                let answer = match transport.create_answer().await {
                    Ok(answer) => answer,
                    Err(e) => return Err(self.reject(e).await),
                };
                self.begin_gathering(GatherPhase::Answer, answer, &transport)
                    .await
            }
        }
    }

    /// Fails immediately unless the channel is `OPEN`; nothing is buffered.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), SignalError> {
        if self.state() != SessionState::Open {
            return Err(SignalError::ChannelNotOpen);
        }
        let transport = self.transport().ok_or(SignalError::ChannelNotOpen)?;
        transport
            .send(data.into())
            .await
            .map_err(|e| SignalError::Transport(e.to_string()))
    }

    /// Explicit teardown from any live state.
    pub async fn close(&self) {
        if self.advance(SessionState::Closed) {
            self.log("closed locally");
            self.release().await;
        }
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner.core.lock().transport.clone()
    }

    fn short(&self) -> &str {
        short_id(&self.inner.id)
    }

    fn log(&self, text: impl AsRef<str>) {
        let who = match &self.inner.peer_id {
            Some(peer) => format!("{}/{}", peer, self.short()),
            None => self.short().to_string(),
        };
        self.inner.log.append(format!("[{who}] {}", text.as_ref()));
    }

    async fn begin_gathering(
        &self,
        phase: GatherPhase,
        desc: SessionDescriptor,
        transport: &Arc<dyn Transport>,
    ) -> Result<(), SignalError> {
        let generation = {
            let mut core = self.inner.core.lock();
            core.local_descriptor = Some(desc.clone());
            core.gatherer.arm(phase)
        };
        if phase == GatherPhase::Answer && !self.advance(SessionState::GatheringLocalAnswer) {
            return Err(SignalError::InvalidState(self.state()));
        }

        self.log(format!("gathering local candidates for {}", desc.kind));
        if let Err(e) = transport.set_local_description(&desc).await {
            return Err(self.reject(e).await);
        }
        if let Some(timeout) = self.inner.gather_timeout {
            self.spawn_gather_deadline(generation, timeout);
        }
        Ok(())
    }

    /// `generation` is set by the deadline timer so it only ends its own phase.
    async fn finish_gathering(&self, generation: Option<u64>) {
        let done = {
            let mut core = self.inner.core.lock();
            if generation.is_some_and(|g| g != core.gatherer.generation()) {
                return;
            }
            let descriptor = core.local_descriptor.clone();
            let payload_id = core.payload_id.clone();
            core.gatherer
                .complete()
                .map(|(phase, candidates)| (phase, candidates, descriptor, payload_id))
        };
        let Some((phase, candidates, Some(descriptor), payload_id)) = done else {
            return;
        };
        if generation.is_some() {
            self.log("gathering timed out, using the candidates found so far");
        }

        let summary = CandidateSummary::of(&candidates);
        self.log(format!("gathered {} candidates ({summary})", candidates.len()));
        if summary.relay == 0 {
            warn!(session = %self.short(), "no relay candidates gathered, connections across NAT may fail");
        }

        let payload = SignalingPayload::new(payload_id, descriptor, candidates);
        let text = match codec::encode(&payload) {
            Ok(text) => text,
            Err(err) => {
                self.fail(&err.to_string()).await;
                return;
            }
        };

        let entered = match phase {
            GatherPhase::Offer => self.advance(SessionState::AwaitingRemote),
            GatherPhase::Answer => self.enter_connecting(),
        };
        if entered {
            self.log(format!(
                "{} payload ready (fingerprint {})",
                payload.descriptor.kind,
                payload_fingerprint(&text)
            ));
            self.inner.payload.send_replace(Some(text));
        }
    }

    fn enter_connecting(&self) -> bool {
        let (from, pending) = {
            let mut core = self.inner.core.lock();
            let from = self.transition(SessionState::Connecting);
            let pending = if from.is_some() {
                core.pending_open.take()
            } else {
                None
            };
            (from, pending)
        };
        let Some(from) = from else {
            return false;
        };
        self.announce(from, SessionState::Connecting);
        if let Some(label) = pending {
            // let the pump open the channel so queued messages keep their order
            let _ = self.inner.wake.send(TransportEvent::ChannelOpen { label });
        }
        true
    }

    fn spawn_pump(&self, mut events: EventReceiver) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let session = Session { inner };
                if session.state().is_terminal() {
                    break;
                }
                session.handle_event(event).await;
            }
        });
        self.track(handle);
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let accepted = self.inner.core.lock().gatherer.push(candidate.clone());
                if accepted {
                    debug!(session = %self.short(), candidate = %candidate.candidate, "local candidate");
                } else {
                    debug!(session = %self.short(), candidate = %candidate.candidate, "ignoring candidate outside a gathering phase");
                }
            }
            TransportEvent::GatheringComplete => self.finish_gathering(None).await,
            TransportEvent::ChannelOpen { label } => {
                let open_now = {
                    let mut core = self.inner.core.lock();
                    let state = self.state();
                    if state == SessionState::Connecting {
                        true
                    } else {
                        if state.precedes_connecting() {
                            core.pending_open = Some(label.clone());
                        }
                        false
                    }
                };
                if open_now {
                    self.open_channel(&label);
                }
            }
            TransportEvent::ChannelMessage(data) => self.deliver(data),
            TransportEvent::ChannelClose => {
                if self.advance(SessionState::Closed) {
                    self.log("channel closed by remote");
                    self.release().await;
                }
            }
            TransportEvent::Fatal(reason) => self.fail(&reason).await,
        }
    }

    fn open_channel(&self, label: &str) {
        let opened = {
            let mut core = self.inner.core.lock();
            self.transition(SessionState::Open)
                .map(|from| (from, std::mem::take(&mut core.backlog)))
        };
        if let Some((from, backlog)) = opened {
            self.log(format!("channel `{label}` open"));
            self.announce(from, SessionState::Open);
            for data in backlog {
                self.dispatch(&data);
            }
        }
    }

    fn deliver(&self, data: Bytes) {
        {
            let mut core = self.inner.core.lock();
            let state = self.state();
            if state != SessionState::Open {
                if !state.is_terminal() {
                    core.backlog.push(data);
                }
                return;
            }
        }
        self.dispatch(&data);
    }

    fn dispatch(&self, data: &Bytes) {
        let hooks = self.inner.listeners.lock().message.clone();
        for hook in hooks.iter().chain(self.inner.callbacks.on_message.iter()) {
            hook(self, data);
        }
    }

    /// Atomic check-and-set on the state; `Some(previous)` when it moved.
    fn transition(&self, to: SessionState) -> Option<SessionState> {
        let role = self.inner.role;
        let mut from = None;
        self.inner.state.send_if_modified(|current| {
            if current.can_transition(to, role) {
                from = Some(*current);
                *current = to;
                true
            } else {
                false
            }
        });
        if from.is_none() {
            debug!(session = %self.short(), state = %self.state(), to = %to, "transition refused");
        }
        from
    }

    fn announce(&self, from: SessionState, to: SessionState) {
        info!(session = %self.short(), role = %self.inner.role, %from, %to, "session state changed");
        self.log(format!("{from} -> {to}"));

        let hooks = self.inner.listeners.lock().state.clone();
        for hook in &hooks {
            hook(self, to);
        }
        let callbacks = &self.inner.callbacks;
        if to == SessionState::Open {
            if let Some(cb) = &callbacks.on_connect {
                cb(self);
            }
        }
        if from == SessionState::Open && to.is_terminal() {
            if let Some(cb) = &callbacks.on_disconnect {
                cb(self);
            }
        }
    }

    fn advance(&self, to: SessionState) -> bool {
        match self.transition(to) {
            Some(from) => {
                self.announce(from, to);
                true
            }
            None => false,
        }
    }

    async fn reject(&self, err: TransportError) -> SignalError {
        let err = SignalError::DescriptorRejected(err.to_string());
        self.fail(&err.to_string()).await;
        err
    }

    async fn fail(&self, reason: &str) {
        if self.advance(SessionState::Failed) {
            error!(session = %self.short(), reason, "session failed");
            self.log(format!("failed: {reason}"));
            self.release().await;
        }
    }

    /// Drops transport, candidates and background tasks. No callbacks fire after this.
    async fn release(&self) {
        let transport = {
            let mut core = self.inner.core.lock();
            core.gatherer.clear();
            core.pending_open = None;
            core.backlog.clear();
            core.transport.take()
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn spawn_gather_deadline(&self, generation: u64, timeout: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Session { inner }.finish_gathering(Some(generation)).await;
            }
        });
        self.track(handle);
    }

    fn spawn_expiry(&self, after: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let session = Session { inner };
            let state = session.state();
            if !state.is_terminal() && state.rank() < SessionState::Open.rank() {
                session
                    .fail(&format!("expired after {}s without opening", after.as_secs()))
                    .await;
            }
        });
        self.track(handle);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer_id", &self.inner.peer_id)
            .field("state", &self.state())
            .finish()
    }
}
