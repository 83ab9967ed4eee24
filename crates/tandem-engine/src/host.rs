use crossbeam_queue::ArrayQueue;

use crate::buffer::{AudioBuffer, MAX_BUFFER_LEN};
use crate::command::{Command, CommandKind, Ident, PatchOp, Value};
use crate::error::{ConfigError, EngineError};
use crate::modules::{Module, ModuleKind, ModuleSettings};
use crate::patch::PatchPlan;

/// Counters for commands the host has seen. Plain integers: the host lives
/// on one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub applied: u64,
    /// Unknown module, parameter or gate target.
    pub ignored: u64,
    /// Records that failed to decode.
    pub rejected: u64,
    pub queue_full: u64,
}

/// Read-only view of one module, for status output.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleState {
    pub id: Ident,
    pub kind: ModuleKind,
    pub params: Vec<(&'static str, f64)>,
    pub gate: Option<bool>,
    pub bypassed: bool,
}

#[derive(Debug, Clone)]
struct ModuleSlot {
    id: Ident,
    module: Module,
    inputs: Vec<usize>,
    bypassed: bool,
}

/// Owns a module chain, its scratch buffers and its command queue.
///
/// Commands queued during a block take effect at the start of the next
/// `process_chain` call. Nothing allocates after construction.
#[derive(Debug)]
pub struct ModuleHost {
    settings: ModuleSettings,
    slots: Vec<ModuleSlot>,
    scratch: Vec<AudioBuffer>,
    mix: AudioBuffer,
    output: AudioBuffer,
    queue: ArrayQueue<Command>,
    sequence: u32,
    stats: HostStats,
}

impl ModuleHost {
    pub fn new(
        plan: &PatchPlan,
        settings: ModuleSettings,
        queue_capacity: usize,
    ) -> Result<Self, EngineError> {
        plan.validate()?;
        if settings.block_len == 0 || settings.block_len > MAX_BUFFER_LEN {
            return Err(ConfigError::BufferLen {
                max: MAX_BUFFER_LEN,
                actual: settings.block_len,
            }
            .into());
        }
        if queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "command_capacity",
            }
            .into());
        }

        let mut slots = Vec::with_capacity(plan.len());
        for planned in plan.modules() {
            let mut module = Module::new(planned.kind, &settings);
            for (param, value) in &planned.params {
                module.set_param(param.as_str(), Value::Float(*value));
            }
            // Initial values start settled instead of gliding from defaults.
            module.reset();
            let inputs = planned
                .inputs
                .iter()
                .filter_map(|input| plan.position(*input))
                .collect();
            slots.push(ModuleSlot {
                id: planned.id,
                module,
                inputs,
                bypassed: false,
            });
        }

        let frames = settings.block_len;
        Ok(Self {
            settings,
            scratch: vec![AudioBuffer::silent(frames); slots.len()],
            slots,
            mix: AudioBuffer::silent(frames),
            output: AudioBuffer::silent(frames),
            queue: ArrayQueue::new(queue_capacity),
            sequence: 0,
            stats: HostStats::default(),
        })
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn block_len(&self) -> usize {
        self.settings.block_len
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    pub fn module_ids(&self) -> impl Iterator<Item = Ident> + '_ {
        self.slots.iter().map(|slot| slot.id)
    }

    pub fn module(&self, id: Ident) -> Option<&Module> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| &slot.module)
    }

    /// Queues a command for the next buffer boundary. O(1); hands the
    /// command back when the queue is full.
    pub fn queue_command(&mut self, command: Command) -> Result<(), Command> {
        let result = self.queue.push(command);
        if result.is_err() {
            self.stats.queue_full += 1;
        }
        result
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn apply(&mut self, command: Command) {
        let kind = match command.decode() {
            Ok(kind) => kind,
            Err(_) => {
                self.stats.rejected += 1;
                return;
            }
        };
        let target = kind.module();
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == target) else {
            self.stats.ignored += 1;
            return;
        };
        let applied = match kind {
            CommandKind::SetParam { param, value, .. } => slot.module.set_param(param.as_str(), value),
            CommandKind::SetGate { on, .. } => slot.module.set_gate(on),
            CommandKind::Patch { op, .. } => {
                match op {
                    PatchOp::Reset => slot.module.reset(),
                    PatchOp::Bypass(on) => slot.bypassed = on,
                }
                true
            }
        };
        if applied {
            self.stats.applied += 1;
        } else {
            self.stats.ignored += 1;
        }
    }

    /// Applies queued commands without rendering.
    pub fn apply_pending(&mut self) {
        while let Some(command) = self.queue.pop() {
            self.apply(command);
        }
    }

    /// Applies queued commands, then renders one buffer through the chain.
    pub fn process_chain(&mut self) -> &AudioBuffer {
        self.apply_pending();

        let frames = self.settings.block_len;
        let Self {
            slots,
            scratch,
            mix,
            ..
        } = self;
        for index in 0..slots.len() {
            let input = mix.as_mut_slice();
            let slot = &mut slots[index];
            if slot.inputs.is_empty() {
                match index.checked_sub(1) {
                    Some(previous) => input.copy_from_slice(scratch[previous].as_slice()),
                    None => input.fill(0.0),
                }
            } else {
                input.fill(0.0);
                for source in &slot.inputs {
                    for (acc, sample) in input.iter_mut().zip(scratch[*source].as_slice()) {
                        *acc += *sample;
                    }
                }
            }

            let out = &mut scratch[index].samples[..frames];
            if slot.bypassed {
                out.copy_from_slice(input);
            } else {
                slot.module.render(input, out);
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        if let Some(last) = self.scratch.last() {
            self.output.copy_from(last.as_slice());
        }
        self.output.sequence = self.sequence;
        &self.output
    }

    /// Gates every envelope on or off immediately.
    pub fn gate_all(&mut self, on: bool) {
        for slot in &mut self.slots {
            slot.module.set_gate(on);
        }
    }

    /// Independent copy of the chain state with an empty command queue.
    pub fn fork(&self) -> Self {
        Self {
            settings: self.settings,
            slots: self.slots.clone(),
            scratch: self.scratch.clone(),
            mix: self.mix,
            output: self.output,
            queue: ArrayQueue::new(self.queue.capacity()),
            sequence: self.sequence,
            stats: HostStats::default(),
        }
    }

    /// Current parameter targets and gates of every module.
    pub fn module_states(&self) -> Vec<ModuleState> {
        self.slots
            .iter()
            .map(|slot| ModuleState {
                id: slot.id,
                kind: slot.module.kind(),
                params: slot.module.params(),
                gate: slot.module.gate(),
                bypassed: slot.bypassed,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchBuilder;

    fn id(text: &str) -> Ident {
        Ident::new(text).expect("ident")
    }

    fn settings() -> ModuleSettings {
        ModuleSettings {
            block_len: 128,
            ..ModuleSettings::default()
        }
    }

    #[test]
    fn commands_wait_for_the_next_boundary() {
        let mut host = ModuleHost::new(&PatchPlan::classic(440.0), settings(), 8).expect("host");
        assert!(host.process_chain().as_slice().iter().all(|s| *s == 0.0));
        host.queue_command(Command::set_gate(id("env"), true))
            .expect("queued");
        assert_eq!(host.pending(), 1);
        assert_eq!(host.stats().applied, 0);
        let block = host.process_chain();
        assert!(block.as_slice().iter().any(|s| *s != 0.0));
        assert_eq!(host.stats().applied, 1);
    }

    #[test]
    fn full_queue_rejects() {
        let mut host = ModuleHost::new(&PatchPlan::classic(440.0), settings(), 2).expect("host");
        let cmd = Command::set_gate(id("env"), true);
        assert!(host.queue_command(cmd).is_ok());
        assert!(host.queue_command(cmd).is_ok());
        assert_eq!(host.queue_command(cmd), Err(cmd));
        assert_eq!(host.stats().queue_full, 1);
    }

    #[test]
    fn unknown_targets_are_ignored() {
        let mut host = ModuleHost::new(&PatchPlan::classic(440.0), settings(), 8).expect("host");
        host.queue_command(Command::set_param(id("nope"), id("freq"), Value::Float(1.0)))
            .expect("queued");
        host.queue_command(Command::set_param(id("osc"), id("nope"), Value::Float(1.0)))
            .expect("queued");
        host.queue_command(Command::set_gate(id("flt"), true))
            .expect("queued");
        host.process_chain();
        assert_eq!(host.stats().ignored, 3);
        assert_eq!(host.stats().applied, 0);
    }

    #[test]
    fn bypass_passes_input_through() {
        let mut builder = PatchBuilder::new();
        builder
            .create(id("osc"), ModuleKind::Oscillator)
            .create(id("env"), ModuleKind::Envelope)
            .connect(id("osc"), id("env"));
        let plan = builder.commit().expect("plan");
        let mut host = ModuleHost::new(&plan, settings(), 8).expect("host");
        host.queue_command(Command::patch_op(id("env"), PatchOp::Bypass(true)))
            .expect("queued");
        let mut reference = ModuleHost::new(&plan, settings(), 8).expect("host");
        let bypassed = *host.process_chain();
        reference.process_chain();
        let osc_only = reference.scratch[0];
        assert_eq!(bypassed.as_slice(), osc_only.as_slice());
    }

    #[test]
    fn summed_inputs() {
        let mut builder = PatchBuilder::new();
        builder
            .create(id("a"), ModuleKind::Oscillator)
            .create(id("b"), ModuleKind::Oscillator)
            .create(id("flt"), ModuleKind::Filter)
            .connect(id("a"), id("flt"))
            .connect(id("b"), id("flt"))
            .set_param(id("flt"), id("cutoff"), 20_000.0);
        let plan = builder.commit().expect("plan");
        let mut host = ModuleHost::new(&plan, settings(), 8).expect("host");
        host.process_chain();
        let a = host.scratch[0];
        let b = host.scratch[1];
        let expected: Vec<f32> = a
            .as_slice()
            .iter()
            .zip(b.as_slice())
            .map(|(x, y)| x + y)
            .collect();
        assert_eq!(host.mix.as_slice(), expected.as_slice());
    }

    #[test]
    fn fork_is_independent() {
        let mut host = ModuleHost::new(&PatchPlan::classic(440.0), settings(), 8).expect("host");
        let mut probe = host.fork();
        probe.gate_all(true);
        assert!(probe.process_chain().as_slice().iter().any(|s| *s != 0.0));
        assert!(host.process_chain().as_slice().iter().all(|s| *s == 0.0));
    }
}
