use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::status::{SlotId, SlotState, SlotStatus};
use crate::buffer::AudioBuffer;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::RingError;
use crate::launcher::WorkerProcess;
use crate::patch::PatchPlan;
use crate::ring::{Overflow, SharedRing};
use crate::slot_control::SlotControl;

const EXIT_POLL: Duration = Duration::from_micros(200);

/// Supervisor-side view of one slot. Owns the shared memory; workers come
/// and go.
pub(crate) struct Slot {
    pub id: SlotId,
    pub audio: Arc<SharedRing<AudioBuffer>>,
    pub commands: SharedRing<Command>,
    pub control: SlotControl,
    pub worker: Option<Box<dyn WorkerProcess>>,
    pub state: SlotState,
    pub generation: u32,
    pub spawn_attempts: u32,
    pub since: Instant,
    pub beat: u64,
    pub beat_at: Instant,
    pub plan: PatchPlan,
    pub last_failure: Option<String>,
}

impl Slot {
    pub fn new(id: SlotId, config: &EngineConfig, plan: PatchPlan) -> Result<Self, RingError> {
        let now = Instant::now();
        Ok(Self {
            id,
            audio: Arc::new(SharedRing::create(
                config.ring_capacity,
                Overflow::DropOldest,
            )?),
            commands: SharedRing::create(config.command_capacity, Overflow::DropOldest)?,
            control: SlotControl::create()?,
            worker: None,
            state: SlotState::Idle,
            generation: 0,
            spawn_attempts: 0,
            since: now,
            beat: 0,
            beat_at: now,
            plan,
            last_failure: None,
        })
    }

    pub fn set_state(&mut self, state: SlotState) {
        if self.state != state {
            debug!(slot = %self.id, from = ?self.state, to = ?state, "slot state");
            self.state = state;
            self.since = Instant::now();
            self.beat_at = self.since;
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Records a heartbeat observation; returns `true` when the counter has
    /// not moved for longer than `timeout`.
    pub fn heartbeat_stale(&mut self, now: Instant, timeout: Duration) -> bool {
        let beat = self.control.heartbeat();
        if beat != self.beat {
            self.beat = beat;
            self.beat_at = now;
            return false;
        }
        now.duration_since(self.beat_at) > timeout
    }

    /// Stops the worker and waits for it to be gone. `graceful` sends a
    /// termination request first and escalates to a kill after `grace`.
    /// Returns `false` if the worker could not be confirmed dead.
    pub fn stop_worker(&mut self, graceful: bool, grace: Duration) -> bool {
        let Some(mut worker) = self.worker.take() else {
            return true;
        };
        if graceful && !worker.has_exited() {
            if let Err(err) = worker.terminate() {
                warn!(slot = %self.id, error = ?err, "failed to terminate worker");
            }
            if wait_exit(worker.as_ref(), grace) {
                return true;
            }
        }
        if let Err(err) = worker.kill() {
            warn!(slot = %self.id, error = ?err, "failed to kill worker");
        }
        if wait_exit(worker.as_ref(), grace) {
            return true;
        }
        warn!(slot = %self.id, pid = worker.id(), "worker did not exit");
        self.worker = Some(worker);
        false
    }

    /// Empties the rings and clears the control block for a new generation.
    /// The caller guarantees no worker and no callback use this slot.
    pub fn reset_shared(&mut self) {
        self.audio.reset();
        self.commands.reset();
        self.control.reset(self.generation);
        self.beat = 0;
        self.beat_at = Instant::now();
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            id: self.id,
            state: self.state,
            generation: self.generation,
            pid: self.worker.as_ref().map(|w| w.id()),
            spawn_attempts: self.spawn_attempts,
            occupancy: self.audio.occupancy(),
            control: self.control.stats(),
            last_failure: self.last_failure.clone(),
        }
    }
}

fn wait_exit(worker: &dyn WorkerProcess, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !worker.has_exited() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL);
    }
    true
}
