//! Worker side of a slot: one module host feeding one audio ring.

mod pacing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tandem_dsp::analysis;
use tandem_dsp::utils::NoDenormalsGuard;
use tracing::{debug, info, warn};

use crate::buffer::AudioBuffer;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::host::ModuleHost;
use crate::ipc::WorkerBootstrap;
use crate::modules::ModuleSettings;
use crate::ring::SharedRing;
use crate::slot_control::{SlotControl, WorkerPhase};

pub use pacing::DeadlineScheduler;

/// Rendering and pacing settings handed to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub sample_rate: f32,
    pub buffer_len: usize,
    pub command_capacity: usize,
    pub prefill: usize,
    /// Occupancy the worker keeps at most. Above it a read ring pauses
    /// production and an unread ring drops its oldest buffer.
    pub high_water: usize,
    pub priming_buffers: usize,
    pub spin_us: u64,
    pub gain_smoothing_ms: f32,
    pub filter_smoothing_ms: f32,
}

impl WorkerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            buffer_len: config.buffer_len,
            command_capacity: config.command_capacity,
            prefill: config.prefill,
            high_water: (config.prefill + config.cushion)
                .min(config.ring_capacity - config.cushion),
            priming_buffers: config.priming_buffers,
            spin_us: config.spin_us,
            gain_smoothing_ms: config.gain_smoothing_ms,
            filter_smoothing_ms: config.filter_smoothing_ms,
        }
    }

    pub fn module_settings(&self) -> ModuleSettings {
        ModuleSettings {
            sample_rate: self.sample_rate,
            block_len: self.buffer_len,
            gain_smoothing_ms: self.gain_smoothing_ms,
            filter_smoothing_ms: self.filter_smoothing_ms,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_len as f64 / f64::from(self.sample_rate))
    }
}

/// Flags a worker loop observes. The process binary raises `stop` from its
/// termination handler; `hang` freezes the loop for fault injection.
#[derive(Debug, Default)]
pub struct WorkerSignals {
    pub stop: AtomicBool,
    pub hang: AtomicBool,
}

impl WorkerSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Counters local to one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub rendered: u64,
    pub emergency_fills: u64,
    pub throttled: u64,
    pub trimmed: u64,
    pub rebases: u64,
}

/// Tracks whether anything consumes the audio ring. A ring nobody has read
/// from, or whose tail has not moved for `high_water` cycles, is unread.
#[derive(Debug, Clone, Copy, Default)]
struct ReaderWatch {
    tail: u64,
    seen: bool,
    idle_cycles: u64,
}

impl ReaderWatch {
    fn observe(&mut self, tail: u64) {
        if tail != self.tail {
            self.tail = tail;
            self.seen = true;
            self.idle_cycles = 0;
        } else {
            self.idle_cycles = self.idle_cycles.saturating_add(1);
        }
    }

    /// Follows a tail move made by the producer itself.
    fn follow(&mut self, tail: u64) {
        self.tail = tail;
    }

    fn is_idle(&self, window: usize) -> bool {
        !self.seen || self.idle_cycles >= window as u64
    }
}

pub struct WorkerRuntime {
    slot: usize,
    generation: u32,
    settings: WorkerSettings,
    host: ModuleHost,
    audio: SharedRing<AudioBuffer>,
    commands: SharedRing<Command>,
    control: SlotControl,
    carry: Option<Command>,
    reader: ReaderWatch,
    report: WorkerReport,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    /// Maps the slot's rings and control block and builds the module host.
    pub fn attach(bootstrap: &WorkerBootstrap) -> Result<Self> {
        let audio = SharedRing::attach(&bootstrap.audio).context("failed to attach audio ring")?;
        let commands =
            SharedRing::attach(&bootstrap.commands).context("failed to attach command ring")?;
        let control =
            SlotControl::attach(&bootstrap.control).context("failed to attach slot control")?;
        let settings = bootstrap.settings;
        let host = ModuleHost::new(
            &bootstrap.plan,
            settings.module_settings(),
            settings.command_capacity,
        )
        .context("failed to build module host")?;
        control.set_pid(std::process::id());
        control.beat();
        debug!(
            slot = bootstrap.slot,
            generation = bootstrap.generation,
            modules = bootstrap.plan.len(),
            "worker attached"
        );
        Ok(Self {
            slot: bootstrap.slot,
            generation: bootstrap.generation,
            settings,
            host,
            audio,
            commands,
            control,
            carry: None,
            reader: ReaderWatch::default(),
            report: WorkerReport::default(),
        })
    }

    pub fn report(&self) -> WorkerReport {
        self.report
    }

    pub fn host(&self) -> &ModuleHost {
        &self.host
    }

    /// Moves waiting commands from the shared ring into the host queue.
    /// Stops early when the host queue is full; the overflow command is
    /// retried at the next boundary.
    fn drain_commands(&mut self) {
        if let Some(command) = self.carry.take() {
            if let Err(command) = self.host.queue_command(command) {
                self.carry = Some(command);
                return;
            }
        }
        while let Some(command) = self.commands.consume_latest_with_cushion(0) {
            if let Err(command) = self.host.queue_command(command) {
                self.carry = Some(command);
                return;
            }
        }
    }

    fn render_and_publish(&mut self) {
        let block = self.host.process_chain();
        if !self.audio.publish(block) {
            self.control.record_ring_full();
        }
        self.control.record_rendered();
        self.report.rendered += 1;
    }

    /// Applies pending state, proves the chain makes sound and prefills the
    /// ring. Sets phase `Ready` on success, `PrimingFailed` otherwise.
    pub fn prime(&mut self) -> Result<()> {
        let _denormals = NoDenormalsGuard::new();
        self.control.set_phase(WorkerPhase::Priming);
        self.drain_commands();
        self.host.apply_pending();

        let mut probe = self.host.fork();
        probe.gate_all(true);
        let mut audible = false;
        for _ in 0..self.settings.priming_buffers.max(1) {
            let block = probe.process_chain();
            if !analysis::all_finite(block.as_slice()) {
                self.control.set_phase(WorkerPhase::PrimingFailed);
                bail!("chain produced non-finite samples while priming");
            }
            audible |= analysis::is_non_silent(block.as_slice());
            self.control.beat();
        }
        if !audible {
            self.control.set_phase(WorkerPhase::PrimingFailed);
            bail!(
                "chain stayed below {} dBFS for {} priming buffers",
                analysis::SILENCE_FLOOR_DB,
                self.settings.priming_buffers
            );
        }

        for _ in 0..self.settings.prefill {
            self.render_and_publish();
        }
        self.control.set_phase(WorkerPhase::Ready);
        info!(
            slot = self.slot,
            generation = self.generation,
            prefill = self.settings.prefill,
            "worker primed"
        );
        Ok(())
    }

    /// One pass of the paced loop, without the wait.
    ///
    /// At high water a ring the callback reads pauses production so the
    /// reader catches up. A ring nobody reads (the standby) keeps rendering
    /// on schedule and drops its oldest buffer instead, so its contents and
    /// module state stay current for a failover.
    pub fn cycle(&mut self) {
        self.control.beat();
        self.drain_commands();
        self.reader.observe(self.audio.positions().1);
        let occupancy = self.audio.occupancy();
        if occupancy == 0 {
            // Emergency fill: one extra buffer now, regular buffer below.
            self.render_and_publish();
            self.control.record_emergency_fill();
            self.report.emergency_fills += 1;
        }
        if occupancy < self.settings.high_water {
            self.render_and_publish();
        } else if self.reader.is_idle(self.settings.high_water) {
            if self.audio.discard_oldest() {
                self.reader.follow(self.audio.positions().1);
                self.control.record_trimmed();
                self.report.trimmed += 1;
            }
            self.render_and_publish();
        } else {
            self.host.apply_pending();
            self.control.record_throttled();
            self.report.throttled += 1;
        }
    }

    /// Runs the paced production loop until `signals.stop` is raised.
    pub fn run(&mut self, signals: &WorkerSignals) -> Result<WorkerReport> {
        let _denormals = NoDenormalsGuard::new();
        let period = self.settings.period();
        let mut scheduler = DeadlineScheduler::new(
            period,
            Duration::from_micros(self.settings.spin_us),
            self.settings.high_water as u64 + 1,
        );
        scheduler.start(Instant::now());
        info!(
            slot = self.slot,
            generation = self.generation,
            period_us = period.as_micros() as u64,
            "worker loop started"
        );

        while !signals.stop_requested() {
            if signals.hang.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            self.cycle();
            if !scheduler.wait(&signals.stop) {
                break;
            }
        }

        self.control.set_phase(WorkerPhase::Stopping);
        self.report.rebases = scheduler.rebases();
        if self.report.rebases > 0 {
            warn!(
                slot = self.slot,
                rebases = self.report.rebases,
                "worker fell behind its schedule"
            );
        }
        info!(
            slot = self.slot,
            generation = self.generation,
            rendered = self.report.rendered,
            emergency_fills = self.report.emergency_fills,
            throttled = self.report.throttled,
            trimmed = self.report.trimmed,
            "worker loop stopped"
        );
        Ok(self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Ident, Value};
    use crate::modules::ModuleKind;
    use crate::patch::{PatchBuilder, PatchPlan};
    use crate::ring::Overflow;

    struct Slot {
        audio: SharedRing<AudioBuffer>,
        commands: SharedRing<Command>,
        control: SlotControl,
        bootstrap: WorkerBootstrap,
    }

    fn slot(plan: PatchPlan) -> Slot {
        let config = EngineConfig {
            buffer_len: 64,
            ..EngineConfig::default()
        };
        let audio = SharedRing::create(config.ring_capacity, Overflow::DropOldest).expect("audio");
        let commands =
            SharedRing::create(config.command_capacity, Overflow::DropOldest).expect("commands");
        let control = SlotControl::create().expect("control");
        let bootstrap = WorkerBootstrap {
            slot: 0,
            generation: 1,
            audio: audio.descriptor(),
            commands: commands.descriptor(),
            control: control.descriptor(),
            plan,
            settings: WorkerSettings::from_config(&config),
        };
        Slot {
            audio,
            commands,
            control,
            bootstrap,
        }
    }

    fn id(text: &str) -> Ident {
        Ident::new(text).expect("ident")
    }

    #[test]
    fn priming_applies_waiting_commands_and_prefills() {
        let slot = slot(PatchPlan::classic(440.0));
        assert!(slot
            .commands
            .publish(&Command::set_param(id("osc"), id("freq"), Value::Float(220.0))));
        let mut worker = WorkerRuntime::attach(&slot.bootstrap).expect("attach");
        worker.prime().expect("prime");
        assert_eq!(slot.control.phase(), WorkerPhase::Ready);
        assert_eq!(slot.audio.occupancy(), slot.bootstrap.settings.prefill);
        assert_eq!(slot.control.pid(), std::process::id());
        let osc = worker.host().module(id("osc")).expect("osc");
        assert!(osc.params().contains(&("freq", 220.0)));
    }

    #[test]
    fn priming_rejects_a_silent_chain() {
        let mut builder = PatchBuilder::new();
        builder
            .create(id("osc"), ModuleKind::Oscillator)
            .create(id("env"), ModuleKind::Envelope)
            .connect(id("osc"), id("env"))
            .set_param(id("osc"), id("gain"), 0.0);
        let slot = slot(builder.commit().expect("plan"));
        let mut worker = WorkerRuntime::attach(&slot.bootstrap).expect("attach");
        assert!(worker.prime().is_err());
        assert_eq!(slot.control.phase(), WorkerPhase::PrimingFailed);
        assert_eq!(slot.audio.occupancy(), 0);
    }

    #[test]
    fn empty_ring_triggers_one_emergency_fill() {
        let slot = slot(PatchPlan::classic(440.0));
        let mut worker = WorkerRuntime::attach(&slot.bootstrap).expect("attach");
        worker.cycle();
        assert_eq!(worker.report().emergency_fills, 1);
        assert_eq!(slot.audio.occupancy(), 2);
        worker.cycle();
        assert_eq!(worker.report().emergency_fills, 1);
        assert_eq!(slot.audio.occupancy(), 3);
    }

    #[test]
    fn unread_ring_rolls_at_high_water() {
        let slot = slot(PatchPlan::classic(440.0));
        let mut worker = WorkerRuntime::attach(&slot.bootstrap).expect("attach");
        for _ in 0..32 {
            worker.cycle();
        }
        let high_water = slot.bootstrap.settings.high_water;
        assert_eq!(slot.audio.occupancy(), high_water);
        let report = worker.report();
        assert_eq!(report.throttled, 0);
        // 32 regular buffers plus one emergency fill, all but the newest
        // high_water of them trimmed.
        assert_eq!(report.rendered, 33);
        assert_eq!(report.trimmed, 33 - high_water as u64);
        assert_eq!(slot.audio.dropped(), 0);
        assert_eq!(slot.control.stats().ring_full, 0);
        assert_eq!(slot.control.stats().trimmed, report.trimmed);
    }

    #[test]
    fn unread_ring_keeps_the_newest_state() {
        let slot = slot(PatchPlan::classic(440.0));
        let mut worker = WorkerRuntime::attach(&slot.bootstrap).expect("attach");
        for _ in 0..32 {
            worker.cycle();
        }
        assert!(slot.commands.publish(&Command::set_gate(id("env"), true)));
        for _ in 0..32 {
            worker.cycle();
        }
        // Every buffer left in the ring was rendered after the gate opened.
        let high_water = slot.bootstrap.settings.high_water;
        for _ in 0..high_water {
            let block = slot.audio.consume_latest_with_cushion(0).expect("buffer");
            assert!(analysis::is_non_silent(block.as_slice()));
        }
    }

    #[test]
    fn read_ring_pauses_at_high_water() {
        let slot = slot(PatchPlan::classic(440.0));
        let mut worker = WorkerRuntime::attach(&slot.bootstrap).expect("attach");
        worker.cycle();
        assert!(slot.audio.consume_latest_with_cushion(2).is_some());
        let high_water = slot.bootstrap.settings.high_water;
        while slot.audio.occupancy() < high_water {
            worker.cycle();
        }
        worker.cycle();
        assert_eq!(worker.report().throttled, 1);
        assert_eq!(worker.report().trimmed, 0);
        assert_eq!(slot.audio.occupancy(), high_water);
        assert_eq!(slot.control.stats().throttled, 1);
        assert_eq!(slot.control.stats().ring_full, 0);
    }
}
