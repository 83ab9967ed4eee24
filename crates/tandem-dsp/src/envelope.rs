/// Level treated as "fully released".
const SILENCE_LEVEL: f64 = 1.0e-5;

/// Fraction of the full-scale rise covered between the 10% and 90% marks.
const RISE_SPAN: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// ADSR timing in milliseconds plus the sustain level.
///
/// `attack_ms` is the 10%→90% rise time of the attack ramp.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdsrTimes {
    pub attack_ms: f64,
    pub decay_ms: f64,
    pub sustain: f64,
    pub release_ms: f64,
}

impl Default for AdsrTimes {
    fn default() -> Self {
        Self {
            attack_ms: 10.0,
            decay_ms: 100.0,
            sustain: 0.7,
            release_ms: 200.0,
        }
    }
}

/// Linear ADSR envelope applied in place to a block.
#[derive(Clone, Copy, Debug)]
pub struct Adsr {
    sample_rate: f64,
    times: AdsrTimes,
    stage: EnvelopeStage,
    level: f64,
    attack_step: f64,
    decay_step: f64,
    release_step: f64,
}

impl Adsr {
    pub fn new(sample_rate: f32, times: AdsrTimes) -> Self {
        let mut env = Self {
            sample_rate: f64::from(sample_rate.max(1.0)),
            times,
            stage: EnvelopeStage::Idle,
            level: 0.0,
            attack_step: 0.0,
            decay_step: 0.0,
            release_step: 0.0,
        };
        env.set_times(times);
        env
    }

    pub fn set_times(&mut self, times: AdsrTimes) {
        self.times = AdsrTimes {
            attack_ms: times.attack_ms.max(0.0),
            decay_ms: times.decay_ms.max(0.0),
            sustain: times.sustain.clamp(0.0, 1.0),
            release_ms: times.release_ms.max(0.0),
        };
        self.attack_step = RISE_SPAN / self.samples(self.times.attack_ms);
        self.decay_step = (1.0 - self.times.sustain).max(SILENCE_LEVEL) / self.samples(self.times.decay_ms);
        if self.stage == EnvelopeStage::Release {
            self.release_step = self.level.max(SILENCE_LEVEL) / self.samples(self.times.release_ms);
        }
    }

    pub fn times(&self) -> AdsrTimes {
        self.times
    }

    fn samples(&self, ms: f64) -> f64 {
        (ms * 0.001 * self.sample_rate).max(1.0)
    }

    #[inline]
    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Starts (or restarts) the attack ramp from the current level.
    pub fn gate_on(&mut self) {
        self.stage = EnvelopeStage::Attack;
    }

    pub fn gate_off(&mut self) {
        if self.stage != EnvelopeStage::Idle {
            self.release_step = self.level.max(SILENCE_LEVEL) / self.samples(self.times.release_ms);
            self.stage = EnvelopeStage::Release;
        }
    }

    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Idle;
        self.level = 0.0;
    }

    #[inline]
    pub fn next_level(&mut self) -> f64 {
        match self.stage {
            EnvelopeStage::Idle => {
                self.level = 0.0;
            }
            EnvelopeStage::Attack => {
                self.level += self.attack_step;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                self.level -= self.decay_step;
                if self.level <= self.times.sustain {
                    self.level = self.times.sustain;
                    self.stage = EnvelopeStage::Sustain;
                }
            }
            EnvelopeStage::Sustain => {
                // A sustain change while holding glides instead of jumping.
                let sustain = self.times.sustain;
                if self.level > sustain {
                    self.level = (self.level - self.decay_step).max(sustain);
                } else if self.level < sustain {
                    self.level = (self.level + self.attack_step).min(sustain);
                }
            }
            EnvelopeStage::Release => {
                self.level -= self.release_step;
                if self.level <= SILENCE_LEVEL {
                    self.level = 0.0;
                    self.stage = EnvelopeStage::Idle;
                }
            }
        }
        self.level
    }

    /// Multiplies `block` sample by sample with the envelope level.
    pub fn process_in_place(&mut self, block: &mut [f32]) {
        if self.stage == EnvelopeStage::Idle {
            block.fill(0.0);
            return;
        }
        for sample in block.iter_mut() {
            let level = self.next_level();
            *sample = (f64::from(*sample) * level) as f32;
        }
    }
}
