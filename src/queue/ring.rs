//! Bounded MPMC queue of packed slot references in shared memory
//!
//! Each cell carries a sequence number: a producer may fill cell `pos` when
//! its sequence equals `pos`, a consumer may drain it when the sequence equals
//! `pos + 1`. Publishers push and the owning subscriber pops; publishers also
//! pop when evicting the oldest entry under `DropOldest`.

use std::sync::atomic::Ordering;

use crate::layout::{QueueCell, QueueHeader};

/// View of one subscriber queue
#[derive(Debug, Clone, Copy)]
pub struct SharedQueue<'a> {
    header: &'a QueueHeader,
    cells: &'a [QueueCell],
    mask: u64,
}

impl<'a> SharedQueue<'a> {
    /// Wrap a header and its cells; `cells.len()` must be a power of two
    pub fn new(header: &'a QueueHeader, cells: &'a [QueueCell]) -> Self {
        debug_assert!(cells.len().is_power_of_two());
        Self {
            header,
            cells,
            mask: cells.len() as u64 - 1,
        }
    }

    /// Reset cursors and cell sequences.
    ///
    /// # Safety
    /// No other process may use the queue while it is being reset.
    pub unsafe fn init(&self) {
        for (i, cell) in self.cells.iter().enumerate() {
            cell.value.store(0, Ordering::Relaxed);
            cell.sequence.store(i as u64, Ordering::Relaxed);
        }
        self.header.enqueue_pos.store(0, Ordering::Relaxed);
        self.header.dequeue_pos.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Append a value; `false` when the queue is full
    pub fn push(&self, value: u64) -> bool {
        let mut pos = self.header.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;

            if diff == 0 {
                match self.header.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(value, Ordering::Relaxed);
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.header.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Remove the oldest value; `None` when the queue is empty
    pub fn pop(&self) -> Option<u64> {
        let mut pos = self.header.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[(pos & self.mask) as usize];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - (pos + 1) as i64;

            if diff == 0 {
                match self.header.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.sequence
                            .store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.header.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued values
    pub fn len(&self) -> usize {
        let enqueued = self.header.enqueue_pos.load(Ordering::Acquire);
        let dequeued = self.header.dequeue_pos.load(Ordering::Acquire);
        (enqueued.saturating_sub(dequeued) as usize).min(self.cells.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
