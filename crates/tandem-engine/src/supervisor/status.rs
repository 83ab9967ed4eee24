use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;
use crate::slot_control::ControlStats;

/// One of the two worker slots. Roles move between slots; identity does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub const ALL: [SlotId; 2] = [SlotId::A, SlotId::B];

    pub fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SlotId::A),
            1 => Some(SlotId::B),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotId::A => "a",
            SlotId::B => "b",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// No worker launched yet, or shut down.
    Idle,
    /// Launched, not attached yet.
    Spawning,
    /// Attached and warming up.
    Priming,
    /// Primed and producing; eligible to become active.
    Ready,
    /// Its ring feeds the audio callback.
    Active,
    Failed,
}

impl SlotState {
    /// Whether a worker in this state is expected to become ready on its own.
    pub fn is_starting(self) -> bool {
        matches!(self, SlotState::Spawning | SlotState::Priming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineHealth {
    /// Active slot backed by a ready standby.
    Running,
    /// Audio flows but there is no ready standby (or audio is about to
    /// resume on a starting slot).
    Degraded,
    /// Neither slot can produce audio; output is silence.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub id: SlotId,
    pub state: SlotState,
    pub generation: u32,
    pub pid: Option<u32>,
    pub spawn_attempts: u32,
    pub occupancy: usize,
    pub control: ControlStats,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub health: EngineHealth,
    pub active: Option<SlotId>,
    pub slots: [SlotStatus; 2],
    pub failovers: u64,
    pub commits: u64,
    pub rejected_commits: u64,
    pub commit_pending: bool,
    pub metrics: MetricsSnapshot,
}

impl EngineStatus {
    pub fn slot(&self, id: SlotId) -> &SlotStatus {
        &self.slots[id.index()]
    }
}
