use crate::peer::types::Role;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a connection session.
///
/// Peer: `New → GatheringLocal → AwaitingRemote → Connecting → Open → Closed`.
/// Host: `... AwaitingRemote → GeneratingAnswer → GatheringLocalAnswer → Connecting ...`.
/// Any non-terminal state may move to `Failed`, or to `Closed` on teardown.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    New,
    GatheringLocal,
    AwaitingRemote,
    GeneratingAnswer,
    GatheringLocalAnswer,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// States in which the channel may already have opened underneath us
    pub(crate) fn precedes_connecting(self) -> bool {
        matches!(
            self,
            SessionState::AwaitingRemote
                | SessionState::GeneratingAnswer
                | SessionState::GatheringLocalAnswer
        )
    }

    /// Position along the lifecycle; every legal edge strictly increases it.
    pub fn rank(self) -> u8 {
        match self {
            SessionState::New => 0,
            SessionState::GatheringLocal => 1,
            SessionState::AwaitingRemote => 2,
            SessionState::GeneratingAnswer => 3,
            SessionState::GatheringLocalAnswer => 4,
            SessionState::Connecting => 5,
            SessionState::Open => 6,
            SessionState::Closed | SessionState::Failed => 7,
        }
    }

    pub fn can_transition(self, to: SessionState, role: Role) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Failed) | (_, Closed) => true,
            (New, GatheringLocal) => true,
            (GatheringLocal, AwaitingRemote) => true,
            (AwaitingRemote, Connecting) => role == Role::Peer,
            (AwaitingRemote, GeneratingAnswer) => role == Role::Host,
            (GeneratingAnswer, GatheringLocalAnswer) => role == Role::Host,
            (GatheringLocalAnswer, Connecting) => role == Role::Host,
            (Connecting, Open) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "NEW",
            SessionState::GatheringLocal => "GATHERING_LOCAL",
            SessionState::AwaitingRemote => "AWAITING_REMOTE",
            SessionState::GeneratingAnswer => "GENERATING_ANSWER",
            SessionState::GatheringLocalAnswer => "GATHERING_LOCAL_ANSWER",
            SessionState::Connecting => "CONNECTING",
            SessionState::Open => "OPEN",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
