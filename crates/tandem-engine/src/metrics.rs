use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub callbacks: u64,
    pub buffers_read: u64,
    /// Buffers replaced by the last successfully read one.
    pub last_good: u64,
    /// Buffers emitted as silence because nothing had been read yet.
    pub silence: u64,
    pub fatal_buffers: u64,
    pub failovers: u64,
    pub recorded_samples: u64,
    pub recording_dropped: u64,
    pub max_callback_ns: u64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    callbacks: AtomicU64,
    buffers_read: AtomicU64,
    last_good: AtomicU64,
    silence: AtomicU64,
    fatal_buffers: AtomicU64,
    failovers: AtomicU64,
    recorded_samples: AtomicU64,
    recording_dropped: AtomicU64,
    max_callback_ns: AtomicU64,
}

/// Lock-free counters shared by the realtime callback and the monitor.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    inner: Arc<MetricsInner>,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        #[inline]
        pub fn $record(&self, count: u64) {
            self.inner.$field.fetch_add(count, Ordering::Relaxed);
        }
    };
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_callback, callbacks);
    counter!(record_buffer_read, buffers_read);
    counter!(record_last_good, last_good);
    counter!(record_silence, silence);
    counter!(record_fatal_buffer, fatal_buffers);
    counter!(record_failover, failovers);
    counter!(record_recorded, recorded_samples);
    counter!(record_recording_dropped, recording_dropped);

    #[inline]
    pub fn record_callback_time(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.inner.max_callback_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &*self.inner;
        MetricsSnapshot {
            callbacks: load(&inner.callbacks),
            buffers_read: load(&inner.buffers_read),
            last_good: load(&inner.last_good),
            silence: load(&inner.silence),
            fatal_buffers: load(&inner.fatal_buffers),
            failovers: load(&inner.failovers),
            recorded_samples: load(&inner.recorded_samples),
            recording_dropped: load(&inner.recording_dropped),
            max_callback_ns: load(&inner.max_callback_ns),
        }
    }
}
