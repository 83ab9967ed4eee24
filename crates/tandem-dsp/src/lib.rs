#![deny(unsafe_op_in_unsafe_fn)]

pub mod analysis;
pub mod biquad;
pub mod envelope;
pub mod gain;
pub mod oscillator;
pub mod smoothing;
pub mod utils;

pub use biquad::{Biquad, LowpassCoefficients};
pub use envelope::{Adsr, AdsrTimes, EnvelopeStage};
pub use oscillator::SineOscillator;
pub use smoothing::SmoothedParam;
