//! Bounded segment queue bridging the task and servo threads.
//!
//! Fixed-capacity ring indexed by `start` and `end` with an explicit
//! `all_full` flag (`start == end` alone also means empty). Single
//! producer appends at `end`; single consumer peeks and removes at
//! `start`. `is_full` reports full while a safety margin of slots
//! still remains, so a producer racing the consumer's view cannot
//! overflow the ring.
//!
//! Removal never frees NURBS heap buffers on the consumer side:
//! heap-owning geometry is parked in a pre-allocated reclaim bin and
//! dropped by whoever calls `drain_reclaim` from the task thread.

use cmc_common::consts::QUEUE_MARGIN;

use crate::segment::{Segment, SegmentGeometry};

/// Queue operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("segment queue full")]
    Full,
    #[error("removal of {requested} segments but only {available} queued")]
    Underflow { requested: usize, available: usize },
}

/// Fixed-capacity segment ring.
#[derive(Debug)]
pub struct SegmentQueue {
    slots: Box<[Option<Segment>]>,
    size: usize,
    len: usize,
    /// Next slot to remove.
    start: usize,
    /// Next slot to fill.
    end: usize,
    /// Distinguishes full from empty when `start == end`.
    all_full: bool,
    /// Heap-owning geometry awaiting task-side drop.
    reclaim: Vec<SegmentGeometry>,
}

impl SegmentQueue {
    /// Allocate a queue of `size` slots. Called once at startup.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "queue size must be positive");
        Self {
            slots: (0..size).map(|_| None).collect(),
            size,
            len: 0,
            start: 0,
            end: 0,
            all_full: false,
            reclaim: Vec::with_capacity(size),
        }
    }

    /// Reset to empty. Owned heap buffers are banked for reclaim, not
    /// dropped here; a re-init can run on the servo thread.
    pub fn init(&mut self) {
        for idx in 0..self.slots.len() {
            if let Some(seg) = self.slots[idx].take() {
                self.bank_geometry(seg.geometry);
            }
        }
        self.len = 0;
        self.start = 0;
        self.end = 0;
        self.all_full = false;
    }

    fn bank_geometry(&mut self, geometry: SegmentGeometry) {
        if geometry.owns_heap() {
            if self.reclaim.len() < self.reclaim.capacity() {
                self.reclaim.push(geometry);
            }
            // A full bin means the task thread stopped draining; the
            // buffer drops here as a last resort.
        }
    }

    /// Append a segment at the tail. Producer side.
    pub fn push(&mut self, seg: Segment) -> Result<(), QueueError> {
        if self.all_full {
            return Err(QueueError::Full);
        }
        self.slots[self.end] = Some(seg);
        self.len += 1;
        self.end = (self.end + 1) % self.size;
        if self.end == self.start {
            self.all_full = true;
        }
        Ok(())
    }

    /// Remove `n` segments from the head. Consumer side.
    pub fn remove(&mut self, n: usize) -> Result<(), QueueError> {
        if n == 0 {
            return Ok(());
        }
        if n > self.len {
            return Err(QueueError::Underflow { requested: n, available: self.len });
        }
        for _ in 0..n {
            if let Some(seg) = self.slots[self.start].take() {
                self.bank_geometry(seg.geometry);
            }
            self.start = (self.start + 1) % self.size;
        }
        self.len -= n;
        self.all_full = false;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Peek the `n`-th queued segment without removing it.
    pub fn item(&self, n: usize) -> Option<&Segment> {
        if n >= self.len {
            return None;
        }
        self.slots[(self.start + n) % self.size].as_ref()
    }

    pub fn item_mut(&mut self, n: usize) -> Option<&mut Segment> {
        if n >= self.len {
            return None;
        }
        self.slots[(self.start + n) % self.size].as_mut()
    }

    /// Head segment and its successor, both mutable, for blending.
    pub fn front_pair_mut(&mut self) -> (Option<&mut Segment>, Option<&mut Segment>) {
        match self.len {
            0 => (None, None),
            1 => (self.slots[self.start].as_mut(), None),
            _ => {
                let i = self.start;
                let j = (self.start + 1) % self.size;
                if i < j {
                    let (a, b) = self.slots.split_at_mut(j);
                    (a[i].as_mut(), b[0].as_mut())
                } else {
                    let (a, b) = self.slots.split_at_mut(i);
                    (b[0].as_mut(), a[j].as_mut())
                }
            }
        }
    }

    /// Full indication for the producer: true once length enters the
    /// safety margin (or the ring is physically full for tiny queues).
    pub fn is_full(&self) -> bool {
        if self.size <= QUEUE_MARGIN {
            self.all_full
        } else {
            self.len >= self.size - QUEUE_MARGIN
        }
    }

    /// Drop banked heap buffers. Task-thread side.
    pub fn drain_reclaim(&mut self) -> usize {
        let n = self.reclaim.len();
        self.reclaim.clear();
        n
    }

    /// Buffers currently waiting in the reclaim bin.
    #[inline]
    pub fn reclaim_pending(&self) -> usize {
        self.reclaim.len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
