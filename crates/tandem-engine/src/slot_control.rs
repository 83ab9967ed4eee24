//! Per-slot control block shared between the supervisor and one worker.
//!
//! Holds liveness and progress counters only; commands and audio travel
//! through the rings.

use std::mem::size_of;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::RingError;
use crate::shm::SharedRegion;

const CONTROL_MAGIC: u64 = 0x5441_4e44_4354_524c; // "TANDCTRL"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Starting,
    Priming,
    Ready,
    PrimingFailed,
    Stopping,
}

impl WorkerPhase {
    fn to_raw(self) -> u32 {
        match self {
            WorkerPhase::Starting => 0,
            WorkerPhase::Priming => 1,
            WorkerPhase::Ready => 2,
            WorkerPhase::PrimingFailed => 3,
            WorkerPhase::Stopping => 4,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => WorkerPhase::Priming,
            2 => WorkerPhase::Ready,
            3 => WorkerPhase::PrimingFailed,
            4 => WorkerPhase::Stopping,
            _ => WorkerPhase::Starting,
        }
    }
}

#[repr(C)]
struct ControlBlock {
    magic: u64,
    heartbeat: AtomicU64,
    rendered: AtomicU64,
    emergency_fills: AtomicU64,
    ring_full: AtomicU64,
    throttled: AtomicU64,
    trimmed: AtomicU64,
    phase: AtomicU32,
    pid: AtomicU32,
    generation: AtomicU32,
    _reserved: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlDescriptor {
    pub path: PathBuf,
}

/// Counters read by the monitor context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStats {
    pub heartbeat: u64,
    pub rendered: u64,
    pub emergency_fills: u64,
    /// Publishes that found no room.
    pub ring_full: u64,
    /// Cycles skipped because the reader was far enough behind.
    pub throttled: u64,
    /// Unread buffers dropped to keep an unread ring current.
    pub trimmed: u64,
}

#[derive(Debug)]
pub struct SlotControl {
    region: SharedRegion,
}

impl SlotControl {
    pub fn create() -> Result<Self, RingError> {
        let region = SharedRegion::create("tandem-ctrl-", size_of::<ControlBlock>())?;
        unsafe {
            std::ptr::write(
                region.base() as *mut ControlBlock,
                ControlBlock {
                    magic: CONTROL_MAGIC,
                    heartbeat: AtomicU64::new(0),
                    rendered: AtomicU64::new(0),
                    emergency_fills: AtomicU64::new(0),
                    ring_full: AtomicU64::new(0),
                    throttled: AtomicU64::new(0),
                    trimmed: AtomicU64::new(0),
                    phase: AtomicU32::new(WorkerPhase::Starting.to_raw()),
                    pid: AtomicU32::new(0),
                    generation: AtomicU32::new(0),
                    _reserved: 0,
                },
            );
        }
        Ok(Self { region })
    }

    pub fn attach(descriptor: &ControlDescriptor) -> Result<Self, RingError> {
        let region = SharedRegion::attach(&descriptor.path, size_of::<ControlBlock>())?;
        let block = unsafe { &*(region.base() as *const ControlBlock) };
        if block.magic != CONTROL_MAGIC {
            return Err(RingError::BadMagic(descriptor.path.clone()));
        }
        Ok(Self { region })
    }

    pub fn descriptor(&self) -> ControlDescriptor {
        ControlDescriptor {
            path: self.region.path().to_path_buf(),
        }
    }

    #[inline]
    fn block(&self) -> &ControlBlock {
        unsafe { &*(self.region.base() as *const ControlBlock) }
    }

    /// Clears every counter before a new worker generation attaches.
    pub fn reset(&self, generation: u32) {
        let block = self.block();
        block.heartbeat.store(0, Ordering::Relaxed);
        block.rendered.store(0, Ordering::Relaxed);
        block.emergency_fills.store(0, Ordering::Relaxed);
        block.ring_full.store(0, Ordering::Relaxed);
        block.throttled.store(0, Ordering::Relaxed);
        block.trimmed.store(0, Ordering::Relaxed);
        block.pid.store(0, Ordering::Relaxed);
        block.generation.store(generation, Ordering::Relaxed);
        block
            .phase
            .store(WorkerPhase::Starting.to_raw(), Ordering::Release);
    }

    #[inline]
    pub fn beat(&self) {
        self.block().heartbeat.fetch_add(1, Ordering::Release);
    }

    pub fn heartbeat(&self) -> u64 {
        self.block().heartbeat.load(Ordering::Acquire)
    }

    pub fn set_phase(&self, phase: WorkerPhase) {
        self.block().phase.store(phase.to_raw(), Ordering::Release);
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_raw(self.block().phase.load(Ordering::Acquire))
    }

    pub fn set_pid(&self, pid: u32) {
        self.block().pid.store(pid, Ordering::Relaxed);
    }

    pub fn pid(&self) -> u32 {
        self.block().pid.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u32 {
        self.block().generation.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_rendered(&self) {
        self.block().rendered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_emergency_fill(&self) {
        self.block().emergency_fills.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ring_full(&self) {
        self.block().ring_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_throttled(&self) {
        self.block().throttled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trimmed(&self) {
        self.block().trimmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ControlStats {
        let block = self.block();
        ControlStats {
            heartbeat: block.heartbeat.load(Ordering::Relaxed),
            rendered: block.rendered.load(Ordering::Relaxed),
            emergency_fills: block.emergency_fills.load(Ordering::Relaxed),
            ring_full: block.ring_full.load(Ordering::Relaxed),
            throttled: block.throttled.load(Ordering::Relaxed),
            trimmed: block.trimmed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_view_shares_counters() {
        let control = SlotControl::create().expect("control");
        let worker = SlotControl::attach(&control.descriptor()).expect("attach");
        worker.beat();
        worker.beat();
        worker.set_phase(WorkerPhase::Ready);
        worker.record_emergency_fill();
        worker.record_throttled();
        worker.record_trimmed();
        worker.record_trimmed();
        assert_eq!(control.heartbeat(), 2);
        assert_eq!(control.phase(), WorkerPhase::Ready);
        let stats = control.stats();
        assert_eq!(stats.emergency_fills, 1);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.trimmed, 2);
        assert_eq!(stats.ring_full, 0);

        control.reset(3);
        assert_eq!(worker.phase(), WorkerPhase::Starting);
        assert_eq!(worker.generation(), 3);
        assert_eq!(worker.heartbeat(), 0);
        assert_eq!(worker.stats().trimmed, 0);
    }
}
