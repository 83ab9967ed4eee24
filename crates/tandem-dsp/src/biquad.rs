use std::f64::consts::TAU;

use crate::utils::snap_denormal;

/// Normalised low-pass coefficients (`a0 == 1`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LowpassCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl LowpassCoefficients {
    /// Cookbook low-pass derivation for the given cutoff and Q.
    pub fn cookbook(sample_rate: f64, cutoff_hz: f64, q: f64) -> Self {
        let sr = sample_rate.max(1.0);
        let cutoff = cutoff_hz.clamp(10.0, 0.49 * sr);
        let q = q.max(0.05);
        let w0 = TAU * cutoff / sr;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let a0 = 1.0 + alpha;
        let b1 = (1.0 - cos_w0) / a0;
        let b0 = b1 * 0.5;
        Self {
            b0,
            b1,
            b2: b0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Magnitude of the transfer function at `freq_hz`.
    pub fn magnitude_at(&self, sample_rate: f64, freq_hz: f64) -> f64 {
        let w = TAU * freq_hz / sample_rate;
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        (num_re.hypot(num_im)) / (den_re.hypot(den_im))
    }
}

/// Transposed Direct Form II biquad with double precision state.
#[derive(Clone, Copy, Debug)]
pub struct Biquad {
    coeffs: LowpassCoefficients,
    z1: f64,
    z2: f64,
    design: Option<(f64, f64, f64)>,
}

impl Default for Biquad {
    fn default() -> Self {
        Self::new()
    }
}

impl Biquad {
    /// Pass-through filter until a design is applied.
    pub fn new() -> Self {
        Self {
            coeffs: LowpassCoefficients {
                b0: 1.0,
                b1: 0.0,
                b2: 0.0,
                a1: 0.0,
                a2: 0.0,
            },
            z1: 0.0,
            z2: 0.0,
            design: None,
        }
    }

    pub fn lowpass(sample_rate: f64, cutoff_hz: f64, q: f64) -> Self {
        let mut filter = Self::new();
        filter.set_lowpass(sample_rate, cutoff_hz, q);
        filter
    }

    /// Recomputes coefficients only when the design actually changed.
    /// Returns `true` when new coefficients were installed.
    pub fn set_lowpass(&mut self, sample_rate: f64, cutoff_hz: f64, q: f64) -> bool {
        let design = (sample_rate, cutoff_hz, q);
        if self.design == Some(design) {
            return false;
        }
        self.coeffs = LowpassCoefficients::cookbook(sample_rate, cutoff_hz, q);
        self.design = Some(design);
        true
    }

    pub fn coefficients(&self) -> LowpassCoefficients {
        self.coeffs
    }

    #[inline]
    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let c = &self.coeffs;
        let x = f64::from(input);
        let y = snap_denormal(c.b0 * x + self.z1);
        self.z1 = snap_denormal(c.b1 * x - c.a1 * y + self.z2);
        self.z2 = snap_denormal(c.b2 * x - c.a2 * y);
        y as f32
    }

    pub fn process_in_place(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            *sample = self.process(*sample);
        }
    }
}
