use std::marker::PhantomData;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::RingError;
use crate::shm::{align_up, SharedRegion};

const RING_MAGIC: u64 = 0x5441_4e44_5249_4e47; // "TANDRING"

/// What `publish` does when the ring has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Overflow {
    /// Refuse the new value.
    Reject,
    /// Discard the oldest unread slot to make room.
    DropOldest,
}

impl Overflow {
    fn to_raw(self) -> u64 {
        match self {
            Overflow::Reject => 0,
            Overflow::DropOldest => 1,
        }
    }

    fn from_raw(raw: u64) -> Self {
        if raw == 1 {
            Overflow::DropOldest
        } else {
            Overflow::Reject
        }
    }
}

#[repr(C)]
struct RingHeader {
    magic: u64,
    capacity: u64,
    slot_size: u64,
    overflow: u64,
    head: AtomicU64,
    tail: AtomicU64,
    retain: AtomicU64,
    dropped: AtomicU64,
}

/// Describes a ring that another process can map on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingDescriptor {
    pub path: PathBuf,
    pub capacity: u32,
    pub slot_size: u32,
}

/// Single-producer / single-consumer ring of plain-old-data slots in a
/// shared mapping.
///
/// `head` and `tail` count every slot ever published and consumed; the slot
/// index is the counter modulo capacity. The consumer advances `tail` by one
/// per read and keeps a cushion of already-read slots (`retain`) that the
/// producer never overwrites, so `last_consumed` always returns intact data.
pub struct SharedRing<T> {
    region: SharedRegion,
    capacity: u64,
    _marker: PhantomData<T>,
}

impl<T> std::fmt::Debug for SharedRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRing")
            .field("path", &self.region.path())
            .field("capacity", &self.capacity)
            .finish()
    }
}

const fn data_offset() -> usize {
    align_up(size_of::<RingHeader>())
}

impl<T: Pod> SharedRing<T> {
    pub const MIN_CAPACITY: usize = 4;

    fn region_len(capacity: usize) -> usize {
        data_offset() + capacity * size_of::<T>()
    }

    pub fn create(capacity: usize, overflow: Overflow) -> Result<Self, RingError> {
        if capacity < Self::MIN_CAPACITY {
            return Err(RingError::Capacity {
                min: Self::MIN_CAPACITY,
                actual: capacity,
            });
        }
        let region = SharedRegion::create("tandem-ring-", Self::region_len(capacity))?;
        unsafe {
            std::ptr::write(
                region.base() as *mut RingHeader,
                RingHeader {
                    magic: RING_MAGIC,
                    capacity: capacity as u64,
                    slot_size: size_of::<T>() as u64,
                    overflow: overflow.to_raw(),
                    head: AtomicU64::new(0),
                    tail: AtomicU64::new(0),
                    retain: AtomicU64::new(0),
                    dropped: AtomicU64::new(0),
                },
            );
        }
        Ok(Self {
            region,
            capacity: capacity as u64,
            _marker: PhantomData,
        })
    }

    /// Maps the ring described by `descriptor` into this process.
    pub fn attach(descriptor: &RingDescriptor) -> Result<Self, RingError> {
        if descriptor.slot_size as usize != size_of::<T>() {
            return Err(RingError::SlotSize {
                region: descriptor.slot_size as usize,
                expected: size_of::<T>(),
            });
        }
        let capacity = descriptor.capacity as usize;
        let region = SharedRegion::attach(&descriptor.path, Self::region_len(capacity))?;
        let header = unsafe { &*(region.base() as *const RingHeader) };
        if header.magic != RING_MAGIC {
            return Err(RingError::BadMagic(descriptor.path.clone()));
        }
        if header.slot_size as usize != size_of::<T>() {
            return Err(RingError::SlotSize {
                region: header.slot_size as usize,
                expected: size_of::<T>(),
            });
        }
        if header.capacity != descriptor.capacity as u64 {
            return Err(RingError::Capacity {
                min: header.capacity as usize,
                actual: capacity,
            });
        }
        Ok(Self {
            region,
            capacity: header.capacity,
            _marker: PhantomData,
        })
    }

    pub fn descriptor(&self) -> RingDescriptor {
        RingDescriptor {
            path: self.region.path().to_path_buf(),
            capacity: self.capacity as u32,
            slot_size: size_of::<T>() as u32,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { &*(self.region.base() as *const RingHeader) }
    }

    #[inline]
    fn slot_ptr(&self, counter: u64) -> *mut T {
        let index = (counter % self.capacity) as usize;
        unsafe { (self.region.base().add(data_offset()) as *mut T).add(index) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn overflow(&self) -> Overflow {
        Overflow::from_raw(self.header().overflow)
    }

    /// Unread slots.
    pub fn occupancy(&self) -> usize {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.capacity) as usize
    }

    /// Slots discarded by `Overflow::DropOldest`.
    pub fn dropped(&self) -> u64 {
        self.header().dropped.load(Ordering::Relaxed)
    }

    /// Total slots published and consumed since the last reset.
    pub fn positions(&self) -> (u64, u64) {
        let header = self.header();
        (
            header.head.load(Ordering::Acquire),
            header.tail.load(Ordering::Acquire),
        )
    }

    fn writable_limit(&self) -> u64 {
        let retain = self.header().retain.load(Ordering::Acquire);
        self.capacity - retain.min(self.capacity - 1)
    }

    /// Producer side. Returns `false` when the value was refused.
    pub fn publish(&self, value: &T) -> bool {
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        loop {
            let tail = header.tail.load(Ordering::Acquire);
            if head.saturating_sub(tail) < self.writable_limit() {
                break;
            }
            match self.overflow() {
                Overflow::Reject => return false,
                Overflow::DropOldest => {
                    if header
                        .tail
                        .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        header.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        unsafe { std::ptr::write_volatile(self.slot_ptr(head), *value) };
        header.head.store(head + 1, Ordering::Release);
        true
    }

    /// Producer side. Drops the oldest unread slot so the ring can act as a
    /// rolling window while nobody reads it. Returns `false` when the ring
    /// was empty or the consumer claimed that slot first.
    pub fn discard_oldest(&self) -> bool {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        if header.head.load(Ordering::Acquire) <= tail {
            return false;
        }
        header
            .tail
            .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consumer side. Returns the oldest unread slot and advances `tail` by
    /// exactly one, leaving `keep` consumed slots untouched by the producer.
    pub fn consume_latest_with_cushion(&self, keep: usize) -> Option<T> {
        let header = self.header();
        header
            .retain
            .store((keep as u64).min(self.capacity - 1), Ordering::Release);
        loop {
            let tail = header.tail.load(Ordering::Acquire);
            let head = header.head.load(Ordering::Acquire);
            if head <= tail {
                return None;
            }
            let value = unsafe { std::ptr::read_volatile(self.slot_ptr(tail)) };
            // A failed exchange means the producer dropped this slot while it
            // was being copied; the copy may be torn, so read the next one.
            if header
                .tail
                .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(value);
            }
        }
    }

    /// Re-reads the most recently consumed slot.
    pub fn last_consumed(&self) -> Option<T> {
        let tail = self.header().tail.load(Ordering::Acquire);
        if tail == 0 {
            return None;
        }
        Some(unsafe { std::ptr::read_volatile(self.slot_ptr(tail - 1)) })
    }

    /// Empties the ring. Only valid while no consumer reads it.
    pub fn reset(&self) {
        let header = self.header();
        header.tail.store(0, Ordering::Release);
        header.head.store(0, Ordering::Release);
        header.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_one_slot_per_consume() {
        let ring = SharedRing::<u64>::create(8, Overflow::Reject).expect("ring");
        for value in 0..5u64 {
            assert!(ring.publish(&value));
        }
        assert_eq!(ring.occupancy(), 5);
        assert_eq!(ring.consume_latest_with_cushion(2), Some(0));
        assert_eq!(ring.occupancy(), 4);
        assert_eq!(ring.consume_latest_with_cushion(2), Some(1));
        assert_eq!(ring.last_consumed(), Some(1));
    }

    #[test]
    fn reject_respects_retained_cushion() {
        let ring = SharedRing::<u32>::create(4, Overflow::Reject).expect("ring");
        assert!(ring.publish(&1));
        assert_eq!(ring.consume_latest_with_cushion(2), Some(1));
        // capacity 4, two slots retained: two unread fit
        assert!(ring.publish(&2));
        assert!(ring.publish(&3));
        assert!(!ring.publish(&4));
        assert_eq!(ring.last_consumed(), Some(1));
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let ring = SharedRing::<u32>::create(4, Overflow::DropOldest).expect("ring");
        for value in 0..10 {
            assert!(ring.publish(&value));
        }
        assert_eq!(ring.occupancy(), 4);
        assert_eq!(ring.dropped(), 6);
        assert_eq!(ring.consume_latest_with_cushion(0), Some(6));
    }

    #[test]
    fn discard_oldest_advances_one_slot() {
        let ring = SharedRing::<u32>::create(4, Overflow::Reject).expect("ring");
        assert!(!ring.discard_oldest());
        ring.publish(&1);
        ring.publish(&2);
        assert!(ring.discard_oldest());
        assert_eq!(ring.occupancy(), 1);
        assert_eq!(ring.dropped(), 0);
        assert_eq!(ring.consume_latest_with_cushion(0), Some(2));
    }

    #[test]
    fn empty_ring_yields_none() {
        let ring = SharedRing::<u32>::create(4, Overflow::Reject).expect("ring");
        assert_eq!(ring.consume_latest_with_cushion(2), None);
        assert_eq!(ring.last_consumed(), None);
    }

    #[test]
    fn reset_clears_counters() {
        let ring = SharedRing::<u32>::create(4, Overflow::DropOldest).expect("ring");
        ring.publish(&1);
        ring.publish(&2);
        ring.reset();
        assert_eq!(ring.occupancy(), 0);
        assert_eq!(ring.positions(), (0, 0));
    }

    #[test]
    fn attach_rejects_wrong_slot_type() {
        let ring = SharedRing::<u64>::create(4, Overflow::Reject).expect("ring");
        let err = SharedRing::<u32>::attach(&ring.descriptor()).unwrap_err();
        assert!(matches!(err, RingError::SlotSize { .. }));
    }

    #[test]
    fn small_capacity_is_rejected() {
        let err = SharedRing::<u8>::create(2, Overflow::Reject).unwrap_err();
        assert!(matches!(err, RingError::Capacity { min: 4, actual: 2 }));
    }
}
