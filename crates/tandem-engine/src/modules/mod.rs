//! Chain modules as a closed set of variants.

mod envelope;
mod filter;
mod oscillator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::command::Value;
use crate::error::GraphError;

pub use envelope::EnvelopeModule;
pub use filter::FilterModule;
pub use oscillator::OscillatorModule;

/// Rendering context shared by every module of one host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleSettings {
    pub sample_rate: f32,
    pub block_len: usize,
    pub gain_smoothing_ms: f32,
    pub filter_smoothing_ms: f32,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_len: 256,
            gain_smoothing_ms: 5.0,
            filter_smoothing_ms: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Oscillator,
    Envelope,
    Filter,
}

impl ModuleKind {
    pub fn name(self) -> &'static str {
        match self {
            ModuleKind::Oscillator => "oscillator",
            ModuleKind::Envelope => "envelope",
            ModuleKind::Filter => "filter",
        }
    }

    /// Parameters a module of this kind accepts.
    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            ModuleKind::Oscillator => &["freq", "gain"],
            ModuleKind::Envelope => &["attack", "decay", "sustain", "release"],
            ModuleKind::Filter => &["cutoff", "q"],
        }
    }

    pub fn has_gate(self) -> bool {
        matches!(self, ModuleKind::Envelope)
    }

    /// Generators ignore their input.
    pub fn is_generator(self) -> bool {
        matches!(self, ModuleKind::Oscillator)
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModuleKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oscillator" | "osc" | "sine" => Ok(ModuleKind::Oscillator),
            "envelope" | "env" | "adsr" => Ok(ModuleKind::Envelope),
            "filter" | "flt" | "lowpass" => Ok(ModuleKind::Filter),
            other => Err(GraphError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Module {
    Oscillator(OscillatorModule),
    Envelope(EnvelopeModule),
    Filter(FilterModule),
}

impl Module {
    pub fn new(kind: ModuleKind, settings: &ModuleSettings) -> Self {
        match kind {
            ModuleKind::Oscillator => Module::Oscillator(OscillatorModule::new(settings)),
            ModuleKind::Envelope => Module::Envelope(EnvelopeModule::new(settings)),
            ModuleKind::Filter => Module::Filter(FilterModule::new(settings)),
        }
    }

    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Oscillator(_) => ModuleKind::Oscillator,
            Module::Envelope(_) => ModuleKind::Envelope,
            Module::Filter(_) => ModuleKind::Filter,
        }
    }

    /// Sets a parameter target. Returns `false` for parameters the module
    /// does not have.
    pub fn set_param(&mut self, param: &str, value: Value) -> bool {
        match self {
            Module::Oscillator(m) => m.set_param(param, value.as_f64()),
            Module::Envelope(m) => m.set_param(param, value.as_f64()),
            Module::Filter(m) => m.set_param(param, value.as_f64()),
        }
    }

    /// Returns `false` for modules without a gate.
    pub fn set_gate(&mut self, on: bool) -> bool {
        match self {
            Module::Envelope(m) => {
                m.set_gate(on);
                true
            }
            Module::Oscillator(_) | Module::Filter(_) => false,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Module::Oscillator(m) => m.reset(),
            Module::Envelope(m) => m.reset(),
            Module::Filter(m) => m.reset(),
        }
    }

    /// Renders one block. `input` and `out` have the same length.
    #[inline]
    pub fn render(&mut self, input: &[f32], out: &mut [f32]) {
        match self {
            Module::Oscillator(m) => m.render(out),
            Module::Envelope(m) => m.render(input, out),
            Module::Filter(m) => m.render(input, out),
        }
    }

    /// Current parameter targets, by name.
    pub fn params(&self) -> Vec<(&'static str, f64)> {
        match self {
            Module::Oscillator(m) => m.params(),
            Module::Envelope(m) => m.params(),
            Module::Filter(m) => m.params(),
        }
    }

    pub fn gate(&self) -> Option<bool> {
        match self {
            Module::Envelope(m) => Some(m.gate()),
            Module::Oscillator(_) | Module::Filter(_) => None,
        }
    }
}
