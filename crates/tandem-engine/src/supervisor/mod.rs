//! Dual-slot supervisor and failover state machine.
//!
//! The supervisor owns both slots' shared memory, the callback fence and the
//! parameter ledger. It never runs on the audio thread: `poll` is driven by
//! the monitor context (see [`MonitorHandle`]) and every public method may
//! block briefly.

mod monitor;
mod slot;
mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::buffer::AudioBuffer;
use crate::callback::{AudioCallback, CallbackFence};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, ProtocolError};
use crate::ipc::WorkerBootstrap;
use crate::launcher::{SlotEvent, WorkerLauncher};
use crate::ledger::ParamLedger;
use crate::metrics::EngineMetrics;
use crate::patch::PatchPlan;
use crate::recording::RecordingTap;
use crate::ring::SharedRing;
use crate::slot_control::WorkerPhase;
use crate::snapshot::EngineSnapshot;
use crate::worker::WorkerSettings;

use slot::Slot;

pub use monitor::MonitorHandle;
pub use status::{EngineHealth, EngineStatus, SlotId, SlotState, SlotStatus};

/// How long a failover waits for the callback to leave the failed ring.
const FENCE_TIMEOUT: Duration = Duration::from_millis(100);
/// Grace period for a worker to exit after SIGTERM.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const KILL_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct PendingCommit {
    slot: SlotId,
    plan: PatchPlan,
    ledger: ParamLedger,
}

pub struct Supervisor {
    config: EngineConfig,
    settings: WorkerSettings,
    launcher: Arc<dyn WorkerLauncher>,
    slots: [Slot; 2],
    fence: Arc<CallbackFence>,
    metrics: EngineMetrics,
    events_tx: Sender<SlotEvent>,
    events_rx: Receiver<SlotEvent>,
    plan: PatchPlan,
    ledger: ParamLedger,
    pending: Option<PendingCommit>,
    failovers: u64,
    commits: u64,
    rejected_commits: u64,
    health: EngineHealth,
    started: bool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("launcher", &self.launcher.name())
            .field("active", &self.fence.active())
            .field("health", &self.health)
            .field("failovers", &self.failovers)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        plan: PatchPlan,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        plan.validate()?;
        ensure_seed_fits(&config, &plan)?;
        let slots = [
            Slot::new(SlotId::A, &config, plan.clone())?,
            Slot::new(SlotId::B, &config, plan.clone())?,
        ];
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            settings: WorkerSettings::from_config(&config),
            config,
            launcher,
            slots,
            fence: Arc::new(CallbackFence::new()),
            metrics: EngineMetrics::new(),
            events_tx,
            events_rx,
            plan,
            ledger: ParamLedger::new(),
            pending: None,
            failovers: 0,
            commits: 0,
            rejected_commits: 0,
            health: EngineHealth::Degraded,
            started: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn plan(&self) -> &PatchPlan {
        &self.plan
    }

    pub fn ledger(&self) -> &ParamLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.clone()
    }

    pub fn fence(&self) -> Arc<CallbackFence> {
        Arc::clone(&self.fence)
    }

    pub fn audio_rings(&self) -> [Arc<SharedRing<AudioBuffer>>; 2] {
        [
            Arc::clone(&self.slots[0].audio),
            Arc::clone(&self.slots[1].audio),
        ]
    }

    /// Builds the realtime callback bound to this supervisor's rings.
    pub fn callback(&self) -> AudioCallback {
        AudioCallback::new(
            self.audio_rings(),
            self.fence(),
            self.metrics(),
            self.config.cushion,
            self.config.buffer_len,
        )
    }

    pub fn callback_with_recording(&self, tap: RecordingTap) -> AudioCallback {
        self.callback().with_recording(tap)
    }

    fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.index()]
    }

    fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id.index()]
    }

    pub fn active(&self) -> Option<SlotId> {
        self.fence.active().and_then(SlotId::from_index)
    }

    /// Launches both workers and waits until one of them is active.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        for id in SlotId::ALL {
            self.respawn(id);
        }
        let deadline = Instant::now() + self.config.priming_timeout() * 2;
        loop {
            let status = self.poll();
            if status.active.is_some() {
                info!(
                    active = ?status.active,
                    launcher = self.launcher.name(),
                    "engine started"
                );
                return Ok(());
            }
            if status.health == EngineHealth::Fatal {
                return Err(EngineError::Fatal);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::PrimingTimeout {
                    slot: 0,
                    timeout_ms: self.config.priming_timeout_ms,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Records `command` and writes it into both slots' command rings.
    /// Commands no module of the current or pending plan can apply are
    /// dropped here, so the ledger stays bounded by the plan.
    pub fn send(&mut self, command: Command) -> Result<(), ProtocolError> {
        let kind = command.decode()?;
        let live = self.plan.accepts(&kind);
        let pending = self
            .pending
            .as_mut()
            .filter(|pending| pending.plan.accepts(&kind));
        if !live && pending.is_none() {
            debug!(module = %kind.module(), "dropping command for a module the patch lacks");
            return Ok(());
        }
        if let Some(pending) = pending {
            pending.ledger.record(&kind);
        }
        if live {
            self.ledger.record(&kind);
        }
        for slot in &self.slots {
            slot.commands.publish(&command);
        }
        Ok(())
    }

    /// Parses one control line and sends it. Protocol faults are logged and
    /// dropped.
    pub fn send_line(&mut self, line: &str) -> bool {
        match crate::control::parse_line(line) {
            Some(command) => self.send(command).is_ok(),
            None => false,
        }
    }

    /// Rebuilds the standby slot with `plan` and switches to it once it is
    /// primed. The active graph keeps playing until then, and stays if the
    /// new plan fails to prime. Gates and bypass flags of modules that keep
    /// their id carry over; parameters come from the new plan.
    pub fn commit_patch(&mut self, plan: PatchPlan) -> Result<(), EngineError> {
        let ledger = self.ledger.carry_over(&plan);
        self.commit_with_ledger(plan, ledger)
    }

    fn commit_with_ledger(
        &mut self,
        plan: PatchPlan,
        mut ledger: ParamLedger,
    ) -> Result<(), EngineError> {
        plan.validate()?;
        ensure_seed_fits(&self.config, &plan)?;
        ledger.restrict_to(&plan);
        if self.pending.is_some() {
            return Err(EngineError::CommitInProgress);
        }
        let Some(active) = self.active() else {
            if self.started {
                return Err(EngineError::NotStarted);
            }
            for slot in &mut self.slots {
                slot.plan = plan.clone();
            }
            self.plan = plan;
            self.ledger = ledger;
            return Ok(());
        };
        let target = active.other();
        info!(slot = %target, modules = plan.len(), "committing patch to standby");
        if !self.slot_mut(target).stop_worker(true, TERMINATE_GRACE) {
            return Err(EngineError::Spawn {
                slot: target.index(),
                source: anyhow::anyhow!("previous standby worker did not exit"),
            });
        }
        self.slot_mut(target).plan = plan.clone();
        self.slot_mut(target).spawn_attempts = 0;
        self.pending = Some(PendingCommit {
            slot: target,
            plan,
            ledger,
        });
        self.respawn(target);
        Ok(())
    }

    /// Restores a snapshot: commits its plan and replays its parameters.
    pub fn restore(&mut self, snapshot: EngineSnapshot) -> Result<(), EngineError> {
        self.commit_with_ledger(snapshot.plan, snapshot.params)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::new(self.plan.clone(), self.ledger.clone())
    }

    /// Fault injection: kills the worker in `slot` without cooperation.
    pub fn kill_worker(&mut self, id: SlotId) -> anyhow::Result<()> {
        match self.slot_mut(id).worker.as_mut() {
            Some(worker) => worker.kill(),
            None => anyhow::bail!("slot {id} has no worker"),
        }
    }

    fn bootstrap(&self, id: SlotId) -> WorkerBootstrap {
        let slot = self.slot(id);
        WorkerBootstrap {
            slot: id.index(),
            generation: slot.generation,
            audio: slot.audio.descriptor(),
            commands: slot.commands.descriptor(),
            control: slot.control.descriptor(),
            plan: slot.plan.clone(),
            settings: self.settings,
        }
    }

    /// Launches a fresh worker generation into a vacant slot, seeding its
    /// command ring from the ledger. The slot must not be read by the
    /// callback.
    fn respawn(&mut self, id: SlotId) {
        let pending_seed = self
            .pending
            .as_ref()
            .filter(|pending| pending.slot == id)
            .map(|pending| pending.ledger.commands());
        let seed = match pending_seed {
            Some(seed) => seed,
            None => {
                let plan = self.plan.clone();
                self.slot_mut(id).plan = plan;
                self.ledger.commands()
            }
        };
        let slot = self.slot_mut(id);
        slot.generation = slot.generation.wrapping_add(1);
        slot.spawn_attempts += 1;
        slot.reset_shared();
        for command in &seed {
            slot.commands.publish(command);
        }
        let bootstrap = self.bootstrap(id);
        let generation = bootstrap.generation;
        let launched = self.launcher.launch(bootstrap, self.events_tx.clone());
        match launched {
            Ok(worker) => {
                let slot = self.slot_mut(id);
                info!(slot = %id, generation, pid = worker.id(), "worker launched");
                slot.worker = Some(worker);
                slot.set_state(SlotState::Spawning);
            }
            Err(err) => {
                let slot = self.slot_mut(id);
                warn!(slot = %id, generation, error = ?err, "worker launch failed");
                slot.last_failure = Some(format!("{err:#}"));
                slot.set_state(SlotState::Failed);
            }
        }
    }

    fn mark_failed(&mut self, id: SlotId, reason: String) {
        let slot = self.slot_mut(id);
        if slot.state == SlotState::Failed {
            return;
        }
        warn!(slot = %id, generation = slot.generation, %reason, "slot failed");
        slot.last_failure = Some(reason);
        slot.set_state(SlotState::Failed);
    }

    fn handle_event(&mut self, event: SlotEvent) {
        let Some(id) = SlotId::from_index(event.slot()) else {
            return;
        };
        if event.generation() != self.slot(id).generation {
            return;
        }
        match event {
            SlotEvent::Attached { pid, .. } => {
                self.slot(id).control.set_pid(pid);
            }
            SlotEvent::Primed { .. } => {}
            SlotEvent::PrimingFailed { reason, .. } => {
                self.mark_failed(id, format!("priming failed: {reason}"));
            }
            SlotEvent::Exited { code, .. } => {
                if self.slot(id).state != SlotState::Idle {
                    self.mark_failed(id, format!("worker exited (code {code:?})"));
                }
            }
        }
    }

    fn check_slot(&mut self, id: SlotId, now: Instant) {
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let priming_timeout = self.config.priming_timeout();
        let slot = self.slot_mut(id);
        let state = slot.state;
        if !slot.has_worker() || matches!(state, SlotState::Failed | SlotState::Idle) {
            return;
        }
        let phase = slot.control.phase();
        if state.is_starting() {
            match phase {
                WorkerPhase::Priming if state == SlotState::Spawning => {
                    slot.set_state(SlotState::Priming);
                }
                WorkerPhase::Ready => {
                    slot.spawn_attempts = 0;
                    slot.last_failure = None;
                    info!(slot = %id, generation = slot.generation, "slot ready");
                    slot.set_state(SlotState::Ready);
                }
                WorkerPhase::PrimingFailed => {
                    self.mark_failed(id, "priming failed".into());
                    return;
                }
                _ => {}
            }
            let slot = self.slot_mut(id);
            if slot.state.is_starting() && now.duration_since(slot.since) > priming_timeout {
                self.mark_failed(
                    id,
                    format!("priming did not finish within {} ms", priming_timeout.as_millis()),
                );
                return;
            }
        }
        let slot = self.slot_mut(id);
        if matches!(slot.state, SlotState::Priming | SlotState::Ready | SlotState::Active)
            && slot.heartbeat_stale(now, heartbeat_timeout)
        {
            self.mark_failed(
                id,
                format!("no heartbeat for {} ms", heartbeat_timeout.as_millis()),
            );
        }
    }

    /// Points the callback at `to`, proves the callback let go of `from`,
    /// then retires `from`. Returns `false` when the fence timed out.
    fn switch(&mut self, from: Option<SlotId>, to: SlotId) -> bool {
        // (1) flip: a single atomic store, effective at the next callback.
        self.fence.switch_to(to.index());
        self.slot_mut(to).set_state(SlotState::Active);
        let Some(from) = from else {
            return true;
        };
        // (2) wait until the callback no longer reads the old ring.
        if !self.fence.wait_released(from.index(), FENCE_TIMEOUT) {
            error!(slot = %from, "callback did not release the previous ring");
            return false;
        }
        true
    }

    /// Tears down a slot that is neither active nor read, then launches a
    /// replacement if attempts remain.
    fn recover(&mut self, id: SlotId) {
        if self.active() == Some(id) || self.fence.is_reading(id.index()) {
            return;
        }
        // (3) the worker is gone before its rings are reset.
        if !self.slot_mut(id).stop_worker(false, KILL_GRACE) {
            return;
        }
        if self.pending.as_ref().is_some_and(|pending| pending.slot == id) {
            warn!(slot = %id, "patch failed to prime; keeping the active graph");
            self.pending = None;
            self.rejected_commits += 1;
            self.slot_mut(id).spawn_attempts = 0;
        }
        if self.slot(id).spawn_attempts >= self.config.max_spawn_attempts {
            return;
        }
        self.respawn(id);
    }

    fn evaluate_health(&mut self) -> EngineHealth {
        let max_attempts = self.config.max_spawn_attempts;
        let active_ok = self
            .active()
            .is_some_and(|id| self.slot(id).state == SlotState::Active);
        let any_ready = self.slots.iter().any(|s| s.state == SlotState::Ready);
        let any_starting = self.slots.iter().any(|s| s.state.is_starting());
        let any_retry = self
            .slots
            .iter()
            .any(|s| s.state == SlotState::Failed && s.spawn_attempts < max_attempts);

        let health = if active_ok && any_ready {
            EngineHealth::Running
        } else if active_ok || any_ready || any_starting || any_retry || !self.started {
            EngineHealth::Degraded
        } else {
            EngineHealth::Fatal
        };
        if health != self.health {
            match health {
                EngineHealth::Fatal => error!(
                    failovers = self.failovers,
                    "no slot can produce audio; output is silenced"
                ),
                EngineHealth::Degraded => warn!("engine degraded: no ready standby"),
                EngineHealth::Running => info!("engine running with a ready standby"),
            }
            self.fence.set_fatal(health == EngineHealth::Fatal);
            self.health = health;
        }
        health
    }

    /// Drives the state machine one step. Called every millisecond by the
    /// monitor context.
    pub fn poll(&mut self) -> EngineStatus {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
        let now = Instant::now();
        for id in SlotId::ALL {
            self.check_slot(id, now);
        }

        let active = self.active();
        if let Some(pending) = self.pending.as_ref().map(|p| p.slot) {
            if self.slot(pending).state == SlotState::Ready {
                // Patch commit: the primed standby takes over. The fence
                // already points at it, so the commit completes even when
                // the callback is slow to release the retired ring.
                let retired = active.filter(|a| *a != pending);
                let released = self.switch(retired, pending);
                if let Some(commit) = self.pending.take() {
                    self.plan = commit.plan;
                    self.ledger = commit.ledger;
                }
                self.commits += 1;
                info!(slot = %pending, "patch committed");
                if let Some(old) = retired {
                    // The retired graph is rebuilt with the new plan so the
                    // standby matches again. A ring still being read is left
                    // to `recover`, which waits for the callback to let go.
                    let slot = self.slot_mut(old);
                    slot.spawn_attempts = 0;
                    if !released {
                        self.mark_failed(old, "callback did not release the retired ring".into());
                    } else if slot.stop_worker(true, TERMINATE_GRACE) {
                        self.respawn(old);
                    } else {
                        self.mark_failed(old, "retired worker did not exit".into());
                    }
                }
            }
        }

        match self.active() {
            Some(id) if self.slot(id).state == SlotState::Failed => {
                let other = id.other();
                if self.slot(other).state == SlotState::Ready
                    && self.pending.as_ref().map(|p| p.slot) != Some(other)
                {
                    let started = Instant::now();
                    if self.switch(Some(id), other) {
                        self.failovers += 1;
                        self.metrics.record_failover(1);
                        info!(
                            from = %id,
                            to = %other,
                            switch_us = started.elapsed().as_micros() as u64,
                            "failover"
                        );
                    }
                } else if !self.slot(other).state.is_starting() {
                    // Nothing to fail over to: detach the callback so the
                    // slot can be rebuilt. Output holds the last good buffer.
                    self.fence.clear();
                    if !self.fence.wait_released(id.index(), FENCE_TIMEOUT) {
                        error!(slot = %id, "callback did not release the failed ring");
                    }
                }
            }
            None => {
                if let Some(ready) = SlotId::ALL.into_iter().find(|id| {
                    self.slot(*id).state == SlotState::Ready
                        && self.pending.as_ref().map(|p| p.slot) != Some(*id)
                }) {
                    self.switch(None, ready);
                    info!(slot = %ready, "slot activated");
                }
            }
            Some(_) => {}
        }

        for id in SlotId::ALL {
            if self.started && self.slot(id).state == SlotState::Failed {
                self.recover(id);
            }
        }
        self.evaluate_health();
        self.status()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            health: self.health,
            active: self.active(),
            slots: [self.slots[0].status(), self.slots[1].status()],
            failovers: self.failovers,
            commits: self.commits,
            rejected_commits: self.rejected_commits,
            commit_pending: self.pending.is_some(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Stops both workers by signal and detaches the callback.
    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.fence.clear();
        for id in SlotId::ALL {
            let slot = self.slot_mut(id);
            slot.set_state(SlotState::Idle);
            slot.stop_worker(true, TERMINATE_GRACE);
        }
        info!(failovers = self.failovers, "engine stopped");
    }
}

/// A respawned worker is seeded from the ledger through its command ring;
/// every entry the plan can produce has to fit.
fn ensure_seed_fits(config: &EngineConfig, plan: &PatchPlan) -> Result<(), ConfigError> {
    let needed = plan.max_ledger_len();
    if needed > config.command_capacity {
        return Err(ConfigError::CommandCapacity {
            needed,
            capacity: config.command_capacity,
        });
    }
    Ok(())
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ThreadLauncher;

    fn supervisor() -> Supervisor {
        Supervisor::new(
            EngineConfig::default(),
            PatchPlan::classic(440.0),
            Arc::new(ThreadLauncher::new()),
        )
        .expect("supervisor")
    }

    #[test]
    fn commands_reach_both_rings_and_the_ledger() {
        let mut supervisor = supervisor();
        assert!(supervisor.send_line("/mod/osc/freq 220"));
        assert!(supervisor.send_line("/gate/env 1"));
        assert!(!supervisor.send_line("/mod/OSC/freq 220"));
        for slot in &supervisor.slots {
            assert_eq!(slot.commands.occupancy(), 2);
        }
        assert_eq!(supervisor.ledger().len(), 2);
        let status = supervisor.status();
        assert_eq!(status.health, EngineHealth::Degraded);
        assert_eq!(status.active, None);
    }

    #[test]
    fn commands_for_absent_modules_stay_out_of_the_ledger() {
        let mut supervisor = supervisor();
        for index in 0..400 {
            assert!(supervisor.send_line(&format!("/mod/ghost{index}/freq 100")));
        }
        assert!(supervisor.send_line("/mod/osc/detune 3"));
        assert!(supervisor.send_line("/mod/osc/freq 330"));
        assert_eq!(supervisor.ledger().len(), 1);
        for slot in &supervisor.slots {
            assert_eq!(slot.commands.occupancy(), 1);
            assert_eq!(slot.commands.dropped(), 0);
        }
    }

    #[test]
    fn command_ring_must_hold_the_seed() {
        let config = EngineConfig {
            command_capacity: 8,
            ..EngineConfig::default()
        };
        let result = Supervisor::new(
            config,
            PatchPlan::classic(440.0),
            Arc::new(ThreadLauncher::new()),
        );
        assert!(matches!(
            result,
            Err(EngineError::Config(ConfigError::CommandCapacity {
                needed: 12,
                capacity: 8
            }))
        ));
    }

    fn poll_until(supervisor: &mut Supervisor, done: impl Fn(&EngineStatus) -> bool) -> EngineStatus {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let status = supervisor.poll();
            if done(&status) {
                return status;
            }
            assert!(Instant::now() < deadline, "{status:#?}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn commit_completes_while_the_old_ring_is_held() {
        let mut supervisor = supervisor();
        supervisor.start().expect("start");
        poll_until(&mut supervisor, |s| s.health == EngineHealth::Running);
        let before = supervisor.active().expect("active");
        let fence = supervisor.fence();
        let held = fence.enter();
        assert_eq!(held, Some(before.index()));

        supervisor
            .commit_patch(PatchPlan::classic(220.0))
            .expect("commit");
        let status = poll_until(&mut supervisor, |s| s.commits == 1);
        assert_eq!(status.active, Some(before.other()));
        assert!(!status.commit_pending);
        assert_eq!(status.slot(before).state, SlotState::Failed);
        assert_eq!(supervisor.plan(), &PatchPlan::classic(220.0));

        // The held ring is left alone until the callback lets go.
        let generation = status.slot(before).generation;
        assert_eq!(supervisor.poll().slot(before).generation, generation);
        fence.exit(held);
        let status = poll_until(&mut supervisor, |s| s.health == EngineHealth::Running);
        assert!(status.slot(before).generation > generation);

        supervisor
            .commit_patch(PatchPlan::classic(330.0))
            .expect("next commit is accepted");
    }

    #[test]
    fn commit_before_start_replaces_the_plan() {
        let mut supervisor = supervisor();
        supervisor
            .commit_patch(PatchPlan::classic(110.0))
            .expect("commit");
        assert_eq!(supervisor.plan(), &PatchPlan::classic(110.0));
        assert!(!supervisor.status().commit_pending);
        assert!(supervisor.kill_worker(SlotId::A).is_err());
    }
}
