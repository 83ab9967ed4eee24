use tandem_dsp::{Biquad, SmoothedParam};

use super::ModuleSettings;

const DEFAULT_CUTOFF: f64 = 2_000.0;
const DEFAULT_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Low-pass biquad whose cutoff and Q glide at the slower filter time
/// constant.
#[derive(Debug, Clone)]
pub struct FilterModule {
    sample_rate: f64,
    biquad: Biquad,
    cutoff: SmoothedParam,
    q: SmoothedParam,
}

impl FilterModule {
    pub fn new(settings: &ModuleSettings) -> Self {
        let smoothed = |value| {
            SmoothedParam::with_time(
                value,
                settings.sample_rate,
                settings.block_len,
                settings.filter_smoothing_ms,
            )
        };
        let sample_rate = f64::from(settings.sample_rate);
        Self {
            sample_rate,
            biquad: Biquad::lowpass(sample_rate, DEFAULT_CUTOFF, DEFAULT_Q),
            cutoff: smoothed(DEFAULT_CUTOFF),
            q: smoothed(DEFAULT_Q),
        }
    }

    pub fn set_param(&mut self, param: &str, value: f64) -> bool {
        match param {
            "cutoff" => self.cutoff.set_target(value.max(1.0)),
            "q" => self.q.set_target(value.max(0.05)),
            _ => return false,
        }
        true
    }

    pub fn reset(&mut self) {
        self.biquad.reset();
        self.cutoff.snap(self.cutoff.target());
        self.q.snap(self.q.target());
    }

    pub fn render(&mut self, input: &[f32], out: &mut [f32]) {
        let (_, cutoff) = self.cutoff.advance();
        let (_, q) = self.q.advance();
        self.biquad.set_lowpass(self.sample_rate, cutoff, q);
        out.copy_from_slice(input);
        self.biquad.process_in_place(out);
    }

    pub fn params(&self) -> Vec<(&'static str, f64)> {
        vec![("cutoff", self.cutoff.target()), ("q", self.q.target())]
    }
}
