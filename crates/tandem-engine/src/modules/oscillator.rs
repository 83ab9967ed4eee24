use tandem_dsp::{SineOscillator, SmoothedParam};

use super::ModuleSettings;

const DEFAULT_FREQUENCY: f64 = 440.0;
const DEFAULT_GAIN: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct OscillatorModule {
    sample_rate: f64,
    osc: SineOscillator,
    frequency: SmoothedParam,
    gain: SmoothedParam,
}

impl OscillatorModule {
    pub fn new(settings: &ModuleSettings) -> Self {
        let smoothed = |value| {
            SmoothedParam::with_time(
                value,
                settings.sample_rate,
                settings.block_len,
                settings.gain_smoothing_ms,
            )
        };
        Self {
            sample_rate: f64::from(settings.sample_rate),
            osc: SineOscillator::new(),
            frequency: smoothed(DEFAULT_FREQUENCY),
            gain: smoothed(DEFAULT_GAIN),
        }
    }

    pub fn set_param(&mut self, param: &str, value: f64) -> bool {
        match param {
            "freq" => self.frequency.set_target(value.max(0.0)),
            "gain" => self.gain.set_target(value.clamp(0.0, 1.0)),
            _ => return false,
        }
        true
    }

    pub fn reset(&mut self) {
        self.osc.reset();
        self.frequency.snap(self.frequency.target());
        self.gain.snap(self.gain.target());
    }

    pub fn render(&mut self, out: &mut [f32]) {
        let (_, frequency) = self.frequency.advance();
        let gain = self.gain.advance();
        self.osc.render(out, self.sample_rate, frequency, gain);
    }

    pub fn params(&self) -> Vec<(&'static str, f64)> {
        vec![("freq", self.frequency.target()), ("gain", self.gain.target())]
    }

    pub fn phase(&self) -> f64 {
        self.osc.phase()
    }
}
