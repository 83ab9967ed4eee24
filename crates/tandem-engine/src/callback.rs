//! Realtime side: copies engine buffers from the active ring into the
//! device buffer. No allocation, no locks, no logging.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::AudioBuffer;
use crate::metrics::EngineMetrics;
use crate::recording::RecordingTap;
use crate::ring::SharedRing;

const NO_SLOT: usize = usize::MAX;
const IDLE: usize = 0;

/// Handshake between the supervisor and the callback about which ring is
/// read.
///
/// The supervisor flips `active`; the callback marks the slot it is
/// currently reading in `in_use` and re-checks `active` afterwards, so once
/// `in_use` no longer names a slot the callback cannot touch that ring again
/// until it is made active once more.
#[derive(Debug)]
pub struct CallbackFence {
    active: AtomicUsize,
    in_use: AtomicUsize,
    last_read: AtomicUsize,
    fatal: AtomicBool,
}

impl Default for CallbackFence {
    fn default() -> Self {
        Self {
            active: AtomicUsize::new(NO_SLOT),
            in_use: AtomicUsize::new(IDLE),
            last_read: AtomicUsize::new(NO_SLOT),
            fatal: AtomicBool::new(false),
        }
    }
}

impl CallbackFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<usize> {
        match self.active.load(Ordering::SeqCst) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    /// Slot the callback read from most recently.
    pub fn last_read(&self) -> Option<usize> {
        match self.last_read.load(Ordering::Acquire) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    /// Points the callback at `slot`; returns the previously active slot.
    pub fn switch_to(&self, slot: usize) -> Option<usize> {
        match self.active.swap(slot, Ordering::SeqCst) {
            NO_SLOT => None,
            previous => Some(previous),
        }
    }

    /// Detaches the callback from every ring; it plays the last good buffer
    /// until a slot is activated again.
    pub fn clear(&self) -> Option<usize> {
        self.switch_to(NO_SLOT)
    }

    pub fn is_reading(&self, slot: usize) -> bool {
        self.in_use.load(Ordering::SeqCst) == slot + 1
    }

    /// Waits until the callback has let go of `slot`. Returns `false` on
    /// timeout.
    pub fn wait_released(&self, slot: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_reading(slot) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }

    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::Release);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn enter(&self) -> Option<usize> {
        loop {
            let slot = self.active.load(Ordering::SeqCst);
            if slot == NO_SLOT {
                return None;
            }
            self.in_use.store(slot + 1, Ordering::SeqCst);
            if self.active.load(Ordering::SeqCst) == slot {
                return Some(slot);
            }
        }
    }

    #[inline]
    pub(crate) fn exit(&self, slot: Option<usize>) {
        self.in_use.store(IDLE, Ordering::SeqCst);
        if let Some(slot) = slot {
            self.last_read.store(slot, Ordering::Release);
        }
    }
}

pub struct AudioCallback {
    rings: [Arc<SharedRing<AudioBuffer>>; 2],
    fence: Arc<CallbackFence>,
    metrics: EngineMetrics,
    cushion: usize,
    buffer_len: usize,
    current: AudioBuffer,
    cursor: usize,
    last_good: Option<AudioBuffer>,
    tap: Option<RecordingTap>,
}

impl AudioCallback {
    pub fn new(
        rings: [Arc<SharedRing<AudioBuffer>>; 2],
        fence: Arc<CallbackFence>,
        metrics: EngineMetrics,
        cushion: usize,
        buffer_len: usize,
    ) -> Self {
        let current = AudioBuffer::silent(buffer_len);
        Self {
            rings,
            fence,
            metrics,
            cushion,
            buffer_len,
            cursor: current.len(),
            current,
            last_good: None,
            tap: None,
        }
    }

    pub fn with_recording(mut self, tap: RecordingTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn fence(&self) -> &Arc<CallbackFence> {
        &self.fence
    }

    /// Loads the next engine buffer from `slot`, or substitutes.
    fn refill(&mut self, slot: Option<usize>) {
        let fresh = slot.and_then(|slot| self.rings[slot].consume_latest_with_cushion(self.cushion));
        self.current = match (fresh, self.last_good) {
            (Some(buffer), _) if !buffer.is_empty() => {
                self.metrics.record_buffer_read(1);
                self.last_good = Some(buffer);
                buffer
            }
            (_, Some(last_good)) => {
                self.metrics.record_last_good(1);
                last_good
            }
            (_, None) => {
                self.metrics.record_silence(1);
                AudioBuffer::silent(self.buffer_len)
            }
        };
        self.cursor = 0;
        if let Some(tap) = self.tap.as_mut() {
            tap.push(self.current.as_slice());
        }
    }

    /// Fills an interleaved device buffer, writing each engine sample to
    /// every channel.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let started = Instant::now();
        self.metrics.record_callback(1);
        let channels = channels.max(1);

        if self.fence.is_fatal() {
            out.fill(0.0);
            self.metrics.record_fatal_buffer(1);
            return;
        }

        let slot = self.fence.enter();
        for frame in out.chunks_mut(channels) {
            if self.cursor >= self.current.len() {
                self.refill(slot);
            }
            let sample = self.current.samples[self.cursor];
            self.cursor += 1;
            frame.fill(sample);
        }
        self.fence.exit(slot);
        self.metrics.record_callback_time(started.elapsed());
    }
}
