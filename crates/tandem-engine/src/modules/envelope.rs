use tandem_dsp::{Adsr, AdsrTimes};

use super::ModuleSettings;

#[derive(Debug, Clone)]
pub struct EnvelopeModule {
    adsr: Adsr,
    gate: bool,
}

impl EnvelopeModule {
    pub fn new(settings: &ModuleSettings) -> Self {
        Self {
            adsr: Adsr::new(settings.sample_rate, AdsrTimes::default()),
            gate: false,
        }
    }

    pub fn set_param(&mut self, param: &str, value: f64) -> bool {
        let mut times = self.adsr.times();
        match param {
            "attack" => times.attack_ms = value,
            "decay" => times.decay_ms = value,
            "sustain" => times.sustain = value,
            "release" => times.release_ms = value,
            _ => return false,
        }
        self.adsr.set_times(times);
        true
    }

    /// Gate edges only; repeating the current gate state is a no-op.
    pub fn set_gate(&mut self, on: bool) {
        if on == self.gate {
            return;
        }
        self.gate = on;
        if on {
            self.adsr.gate_on();
        } else {
            self.adsr.gate_off();
        }
    }

    pub fn gate(&self) -> bool {
        self.gate
    }

    pub fn reset(&mut self) {
        self.adsr.reset();
        self.gate = false;
    }

    pub fn render(&mut self, input: &[f32], out: &mut [f32]) {
        out.copy_from_slice(input);
        self.adsr.process_in_place(out);
    }

    pub fn params(&self) -> Vec<(&'static str, f64)> {
        let times = self.adsr.times();
        vec![
            ("attack", times.attack_ms),
            ("decay", times.decay_ms),
            ("sustain", times.sustain),
            ("release", times.release_ms),
        ]
    }

    pub fn level(&self) -> f64 {
        self.adsr.level()
    }
}
