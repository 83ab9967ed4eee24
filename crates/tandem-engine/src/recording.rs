//! Start/stop capture of the callback's output.
//!
//! The tap lives inside the realtime callback and pushes one copy of every
//! emitted block into an `rtrb` ring while recording is on. The recorder
//! drains that ring from a normal thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rtrb::{Consumer, Producer, RingBuffer};

use crate::metrics::EngineMetrics;

/// Creates a connected tap/recorder pair holding up to `capacity` samples in
/// flight.
pub fn recording_channel(capacity: usize, metrics: EngineMetrics) -> (RecordingTap, Recorder) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let active = Arc::new(AtomicBool::new(false));
    (
        RecordingTap {
            producer,
            active: Arc::clone(&active),
            metrics,
        },
        Recorder {
            consumer,
            active,
            samples: Vec::new(),
        },
    )
}

pub struct RecordingTap {
    producer: Producer<f32>,
    active: Arc<AtomicBool>,
    metrics: EngineMetrics,
}

impl RecordingTap {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Copies `block` into the ring, or drops it whole when it does not fit.
    #[inline]
    pub fn push(&mut self, block: &[f32]) {
        if !self.is_active() || block.is_empty() {
            return;
        }
        match self.producer.write_chunk_uninit(block.len()) {
            Ok(chunk) => {
                let written = chunk.fill_from_iter(block.iter().copied());
                self.metrics.record_recorded(written as u64);
            }
            Err(_) => self.metrics.record_recording_dropped(block.len() as u64),
        }
    }
}

pub struct Recorder {
    consumer: Consumer<f32>,
    active: Arc<AtomicBool>,
    samples: Vec<f32>,
}

impl Recorder {
    pub fn start(&mut self) {
        self.samples.clear();
        self.active.store(true, Ordering::Release);
    }

    /// Stops capturing and returns everything recorded since `start`.
    pub fn stop(&mut self) -> Vec<f32> {
        self.active.store(false, Ordering::Release);
        self.drain();
        std::mem::take(&mut self.samples)
    }

    pub fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Moves samples out of the realtime ring. Call periodically while
    /// recording so the ring does not overflow.
    pub fn drain(&mut self) -> usize {
        let available = self.consumer.slots();
        if available == 0 {
            return 0;
        }
        match self.consumer.read_chunk(available) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                self.samples.extend_from_slice(first);
                self.samples.extend_from_slice(second);
                chunk.commit_all();
                available
            }
            Err(_) => 0,
        }
    }

    pub fn recorded(&self) -> &[f32] {
        &self.samples
    }
}
