use crate::peer::types::IceCandidate;
use std::fmt;

/// Negotiation phase a gathering run belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherPhase {
    Offer,
    Answer,
}

/// Accumulates local candidates for one negotiation phase.
///
/// Candidates are kept in discovery order. [`IceGatherer::complete`] hands out
/// the snapshot exactly once per phase; re-arming drops whatever the previous
/// phase left behind.
#[derive(Debug, Default)]
pub struct IceGatherer {
    phase: Option<GatherPhase>,
    generation: u64,
    candidates: Vec<IceCandidate>,
    completed: bool,
}

impl IceGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new phase. Returns the generation used to match deadlines.
    pub fn arm(&mut self, phase: GatherPhase) -> u64 {
        self.phase = Some(phase);
        self.generation += 1;
        self.candidates.clear();
        self.completed = false;
        self.generation
    }

    pub fn phase(&self) -> Option<GatherPhase> {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_gathering(&self) -> bool {
        self.phase.is_some() && !self.completed
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// false when nothing is being gathered (late or stray candidate)
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if !self.is_gathering() {
            return false;
        }
        self.candidates.push(candidate);
        true
    }

    /// End-of-candidates. `None` if the phase already completed or was never armed.
    pub fn complete(&mut self) -> Option<(GatherPhase, Vec<IceCandidate>)> {
        if !self.is_gathering() {
            return None;
        }
        self.completed = true;
        let phase = self.phase?;
        Some((phase, std::mem::take(&mut self.candidates)))
    }

    /// Drops everything; used on teardown.
    pub fn clear(&mut self) {
        self.phase = None;
        self.candidates = Vec::new();
        self.completed = false;
    }
}

/// Candidate counts by type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateSummary {
    pub fn of(candidates: &[IceCandidate]) -> Self {
        let mut summary = Self::default();
        for candidate in candidates {
            match candidate.kind() {
                Some("host") => summary.host += 1,
                Some("srflx") => summary.srflx += 1,
                Some("relay") => summary.relay += 1,
                _ => summary.other += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }
}

impl fmt::Display for CandidateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} host, {} srflx, {} relay, {} other",
            self.host, self.srflx, self.relay, self.other
        )
    }
}
