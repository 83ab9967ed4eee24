//! Starting, signalling and observing workers.

#[cfg(unix)]
mod process;
mod thread;

use anyhow::Result;
use crossbeam_channel::Sender;

use crate::ipc::WorkerBootstrap;

#[cfg(unix)]
pub use process::ProcessLauncher;
pub use thread::ThreadLauncher;

/// Lifecycle notifications delivered to the supervisor's monitor context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    Attached {
        slot: usize,
        generation: u32,
        pid: u32,
    },
    Primed {
        slot: usize,
        generation: u32,
    },
    PrimingFailed {
        slot: usize,
        generation: u32,
        reason: String,
    },
    /// The worker is gone. `code` is the exit status when it exited normally.
    Exited {
        slot: usize,
        generation: u32,
        code: Option<i32>,
    },
}

impl SlotEvent {
    pub fn slot(&self) -> usize {
        match self {
            SlotEvent::Attached { slot, .. }
            | SlotEvent::Primed { slot, .. }
            | SlotEvent::PrimingFailed { slot, .. }
            | SlotEvent::Exited { slot, .. } => *slot,
        }
    }

    pub fn generation(&self) -> u32 {
        match self {
            SlotEvent::Attached { generation, .. }
            | SlotEvent::Primed { generation, .. }
            | SlotEvent::PrimingFailed { generation, .. }
            | SlotEvent::Exited { generation, .. } => *generation,
        }
    }
}

/// Handle to one running worker.
pub trait WorkerProcess: Send {
    /// OS process id, or a launcher-specific token for in-process workers.
    fn id(&self) -> u32;
    /// Asks the worker to stop (SIGTERM for processes).
    fn terminate(&mut self) -> Result<()>;
    /// Stops the worker without cooperation (SIGKILL for processes).
    fn kill(&mut self) -> Result<()>;
    fn has_exited(&self) -> bool;
}

/// Creates workers for supervisor slots.
pub trait WorkerLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a worker for `bootstrap.slot`. Must not block on the worker's
    /// progress: attach, priming and exit are reported through `events`.
    fn launch(
        &self,
        bootstrap: WorkerBootstrap,
        events: Sender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>>;
}
