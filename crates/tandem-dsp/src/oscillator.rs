use std::f64::consts::TAU;

/// Number of rendered blocks between phase reductions.
const WRAP_INTERVAL: u32 = 64;

/// Phase-accumulator sine generator.
///
/// The phase is held in `f64` and advanced by `increment * frames` once per
/// block, so the first sample of block N+1 sits exactly one increment after
/// the last sample of block N. The accumulator is reduced modulo `TAU` every
/// [`WRAP_INTERVAL`] blocks, never in the middle of a block.
#[derive(Clone, Copy, Debug, Default)]
pub struct SineOscillator {
    phase: f64,
    blocks_since_wrap: u32,
}

impl SineOscillator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.blocks_since_wrap = 0;
    }

    #[inline]
    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Phase advance per sample for `frequency` at `sample_rate`.
    #[inline]
    pub fn increment(sample_rate: f64, frequency: f64) -> f64 {
        let nyquist = sample_rate * 0.5;
        TAU * frequency.clamp(0.0, nyquist) / sample_rate.max(1.0)
    }

    /// Renders one block at a constant frequency while ramping the gain
    /// linearly from `gain.0` (value of the previous block's last sample) to
    /// `gain.1` (value of this block's last sample).
    pub fn render(&mut self, out: &mut [f32], sample_rate: f64, frequency: f64, gain: (f64, f64)) {
        let frames = out.len();
        if frames == 0 {
            return;
        }

        let increment = Self::increment(sample_rate, frequency);
        let (gain_start, gain_end) = gain;
        let gain_step = (gain_end - gain_start) / frames as f64;
        let base = self.phase;

        for (index, sample) in out.iter_mut().enumerate() {
            let phase = base + index as f64 * increment;
            let amplitude = gain_start + gain_step * (index + 1) as f64;
            *sample = (phase.sin() * amplitude) as f32;
        }

        self.phase = base + increment * frames as f64;
        self.blocks_since_wrap += 1;
        if self.blocks_since_wrap >= WRAP_INTERVAL {
            self.phase = self.phase.rem_euclid(TAU);
            self.blocks_since_wrap = 0;
        }
    }
}
