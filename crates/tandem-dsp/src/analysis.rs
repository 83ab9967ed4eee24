//! Block statistics used by priming checks, tests and the offline renderer.

use crate::gain::db_to_linear;

/// Level below which a block counts as silent during priming.
pub const SILENCE_FLOOR_DB: f32 = -80.0;

pub fn rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f64 = block.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
    (sum / block.len() as f64).sqrt() as f32
}

pub fn peak(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

pub fn all_finite(block: &[f32]) -> bool {
    block.iter().all(|s| s.is_finite())
}

pub fn is_non_silent(block: &[f32]) -> bool {
    rms(block) > db_to_linear(SILENCE_FLOOR_DB)
}

/// Largest absolute sample-to-sample step inside `block`, including the step
/// from `previous` (the last sample of the preceding block) when given.
pub fn max_step(block: &[f32], previous: Option<f32>) -> f32 {
    let mut worst = 0.0f32;
    let mut last = previous;
    for sample in block {
        if let Some(prev) = last {
            worst = worst.max((sample - prev).abs());
        }
        last = Some(*sample);
    }
    worst
}
