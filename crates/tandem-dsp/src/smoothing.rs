/// Relative distance below which a smoothed value snaps onto its target.
const SETTLE_EPSILON: f64 = 1.0e-9;

/// Parameter value that moves toward its target once per buffer boundary.
///
/// The per-block coefficient is a one-pole low-pass compounded over
/// `block_len` samples, so a given time constant behaves the same regardless
/// of the block size. Values are kept in double precision because frequency
/// parameters feed the oscillator phase increment directly.
#[derive(Clone, Copy, Debug)]
pub struct SmoothedParam {
    current: f64,
    target: f64,
    coeff: f64,
}

impl SmoothedParam {
    /// Creates a parameter that jumps straight to new targets.
    #[inline]
    pub fn new(value: f64) -> Self {
        Self {
            current: value,
            target: value,
            coeff: 1.0,
        }
    }

    #[inline]
    pub fn with_time(value: f64, sample_rate: f32, block_len: usize, time_ms: f32) -> Self {
        let mut param = Self::new(value);
        param.set_time_ms(sample_rate, block_len, time_ms);
        param
    }

    #[inline]
    pub fn set_time_ms(&mut self, sample_rate: f32, block_len: usize, time_ms: f32) {
        let rate = f64::from(sample_rate.max(1.0));
        let tau = f64::from(time_ms.max(0.0)) * 0.001 * rate;
        let block = block_len.max(1) as f64;
        let coeff = if tau <= 1.0 {
            1.0
        } else {
            1.0 - (-block / tau).exp()
        };
        self.coeff = coeff.clamp(0.0, 1.0);
    }

    #[inline]
    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    /// Moves both the current value and the target, skipping the ramp.
    #[inline]
    pub fn snap(&mut self, value: f64) {
        self.current = value;
        self.target = value;
    }

    #[inline]
    pub fn current(&self) -> f64 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f64 {
        self.target
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        self.current == self.target
    }

    /// Crosses one buffer boundary and returns the value at the start and the
    /// end of the block that follows.
    #[inline]
    pub fn advance(&mut self) -> (f64, f64) {
        let start = self.current;
        let delta = self.target - self.current;
        if delta.abs() <= SETTLE_EPSILON * self.target.abs().max(1.0) {
            self.current = self.target;
        } else {
            self.current += self.coeff * delta;
        }
        (start, self.current)
    }
}
