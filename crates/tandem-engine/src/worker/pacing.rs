use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest single coarse sleep, so a stop request is noticed promptly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Absolute-deadline pacing for a producer loop.
///
/// Deadline `n` is `origin + n * period`; it is never derived from the time
/// the previous cycle finished, so scheduling error does not accumulate.
#[derive(Debug, Clone)]
pub struct DeadlineScheduler {
    origin: Instant,
    period: Duration,
    spin: Duration,
    index: u64,
    max_lag: u64,
    rebases: u64,
}

impl DeadlineScheduler {
    /// `max_lag` is how many periods the loop may fall behind before the
    /// origin is moved forward instead of bursting to catch up.
    pub fn new(period: Duration, spin: Duration, max_lag: u64) -> Self {
        Self {
            origin: Instant::now(),
            period,
            spin: spin.min(period),
            index: 1,
            max_lag: max_lag.max(1),
            rebases: 0,
        }
    }

    pub fn start(&mut self, origin: Instant) {
        self.origin = origin;
        self.index = 1;
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn rebases(&self) -> u64 {
        self.rebases
    }

    /// Absolute time of the next deadline.
    pub fn next_deadline(&self) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(u128::from(self.index));
        self.origin + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Steps to the following deadline.
    pub fn advance(&mut self) {
        self.index += 1;
    }

    /// Sleeps until the next deadline, then advances it by one period.
    /// Coarse sleeps stop `spin` early and a busy-wait covers the tail.
    /// Returns `false` when `stop` was raised while waiting.
    pub fn wait(&mut self, stop: &AtomicBool) -> bool {
        let deadline = self.next_deadline();
        let now = Instant::now();
        if now > deadline + self.period * self.max_lag as u32 {
            // Fell too far behind (suspended, descheduled): restart the grid.
            self.origin = now;
            self.index = 1;
            self.rebases += 1;
            return !stop.load(Ordering::Relaxed);
        }

        loop {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            if remaining > self.spin {
                std::thread::sleep((remaining - self.spin).min(MAX_SLEEP_SLICE));
            } else {
                std::hint::spin_loop();
            }
        }
        self.advance();
        true
    }
}
