//! Lock-free sample pool over the slots of one segment
//!
//! Free slots form a Treiber stack threaded through `SlotMeta::next_free`.
//! The head packs `(tag << 32) | index`; the tag changes on every successful
//! CAS so a slot that is popped and pushed back between a load and the CAS
//! cannot be mistaken for an unchanged head.
//!
//! A slot is held by its writer mark and its readers, both packed into
//! `SlotMeta::refs`. It returns to the free list when the word drops to 0,
//! whichever of the two goes last.

use std::sync::atomic::Ordering;

use log::{error, warn};

use crate::{
    error::{Result, SeuratError},
    layout::{
        refs_readers_of, refs_writer, refs_writer_of, SegmentHeader, SlotMeta, SlotState,
        FREE_LIST_END, REFS_READERS_MASK,
    },
    liveness::now_nanos,
    sync::futex,
};

use super::{slot::SlotRef, stats::PoolStats};

fn pack_head(tag: u32, index: u32) -> u64 {
    (tag as u64) << 32 | index as u64
}

fn unpack_head(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// View of the slot pool inside a mapped segment
#[derive(Clone, Copy)]
pub struct SamplePool<'a> {
    header: &'a SegmentHeader,
    metas: &'a [SlotMeta],
}

impl<'a> SamplePool<'a> {
    pub fn new(header: &'a SegmentHeader, metas: &'a [SlotMeta]) -> Self {
        Self { header, metas }
    }

    /// Link every slot into the free list.
    ///
    /// # Safety
    /// Only the segment creator may call this, before the segment is `Ready`.
    pub unsafe fn init(&self) {
        let count = self.metas.len() as u32;
        for (i, meta) in self.metas.iter().enumerate() {
            let next = if i as u32 + 1 < count { i as u32 + 1 } else { FREE_LIST_END };
            meta.state.store(SlotState::Free.as_raw(), Ordering::Relaxed);
            meta.generation.store(0, Ordering::Relaxed);
            meta.refs.store(0, Ordering::Relaxed);
            meta.next_free.store(next, Ordering::Relaxed);
        }
        let first = if count == 0 { FREE_LIST_END } else { 0 };
        self.header.free_head.store(pack_head(0, first), Ordering::Release);
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.metas.len()
    }

    /// Word signalled whenever a slot returns to the free list
    pub fn slot_signal(&self) -> &'a std::sync::atomic::AtomicU32 {
        &self.header.slot_signal
    }

    fn meta(&self, index: u32) -> Result<&'a SlotMeta> {
        self.metas.get(index as usize).ok_or_else(|| {
            SeuratError::corrupted(format!(
                "Slot index {} out of range for pool of {}",
                index,
                self.metas.len()
            ))
        })
    }

    /// Pop a free slot and mark it `Writing` for publisher entry `writer`.
    ///
    /// Fails with `NoSpace` when the free list is empty.
    pub fn acquire(&self, writer: u32) -> Result<SlotRef> {
        loop {
            let head = self.header.free_head.load(Ordering::Acquire);
            let (tag, index) = unpack_head(head);
            if index == FREE_LIST_END {
                return Err(SeuratError::no_space(self.metas.len()));
            }

            let meta = self.meta(index)?;
            let next = meta.next_free.load(Ordering::Acquire);

            if self
                .header
                .free_head
                .compare_exchange_weak(
                    head,
                    pack_head(tag.wrapping_add(1), next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                meta.next_free.store(FREE_LIST_END, Ordering::Relaxed);
                meta.refs.store(refs_writer(writer + 1), Ordering::Relaxed);
                meta.loaned_at.store(now_nanos(), Ordering::Relaxed);
                meta.state.store(SlotState::Writing.as_raw(), Ordering::Release);
                return Ok(SlotRef::new(index, meta.generation.load(Ordering::Acquire)));
            }
        }
    }

    fn push_free(&self, index: u32, meta: &SlotMeta) {
        loop {
            let head = self.header.free_head.load(Ordering::Acquire);
            let (tag, first) = unpack_head(head);
            meta.next_free.store(first, Ordering::Release);

            if self
                .header
                .free_head
                .compare_exchange_weak(
                    head,
                    pack_head(tag.wrapping_add(1), index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        futex::signal(&self.header.slot_signal);
    }

    /// Return a slot nobody references to the free list
    fn reclaim(&self, index: u32, meta: &SlotMeta) {
        meta.refs.store(0, Ordering::Relaxed);
        meta.generation.fetch_add(1, Ordering::AcqRel);
        meta.state.store(SlotState::Free.as_raw(), Ordering::Release);
        self.push_free(index, meta);
    }

    fn check(&self, slot: SlotRef, expected: SlotState, operation: &str) -> Result<&'a SlotMeta> {
        let meta = self.meta(slot.index)?;
        let generation = meta.generation.load(Ordering::Acquire);
        if generation != slot.generation {
            return Err(SeuratError::corrupted(format!(
                "{} of slot {} with stale generation {} (current {})",
                operation, slot.index, slot.generation, generation
            )));
        }

        let state = meta.state();
        if state != expected {
            return Err(SeuratError::corrupted(format!(
                "{} of slot {} in state {:?}",
                operation, slot.index, state
            )));
        }
        Ok(meta)
    }

    /// Mark a loaned slot `InFlight`. The writer mark keeps it allocated
    /// until [`SamplePool::finish_send`].
    pub fn publish(&self, slot: SlotRef) -> Result<()> {
        let meta = self.check(slot, SlotState::Writing, "publish")?;
        meta.state.store(SlotState::InFlight.as_raw(), Ordering::Release);
        Ok(())
    }

    /// Add a reader reference to an in-flight slot.
    ///
    /// Overflowing the reader count poisons the segment.
    pub fn retain(&self, slot: SlotRef) -> Result<()> {
        let meta = self.check(slot, SlotState::InFlight, "retain")?;
        let result = meta
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs == 0 || refs_readers_of(refs) == u32::MAX {
                    None
                } else {
                    Some(refs + 1)
                }
            });

        match result {
            Ok(_) => Ok(()),
            Err(0) => Err(SeuratError::corrupted(format!(
                "retain of slot {} without references",
                slot.index
            ))),
            Err(_) => {
                error!("Reader count of slot {} overflowed, poisoning segment", slot.index);
                self.header.mark_corrupted();
                Err(SeuratError::corrupted(format!(
                    "Reader count of slot {} overflowed",
                    slot.index
                )))
            }
        }
    }

    /// Drop one reader reference. Returns `true` when this was the last
    /// reference and the slot went back to the free list.
    ///
    /// Releasing a free slot, a stale handle or a slot without readers is
    /// rejected with `Corrupted` and leaves the slot untouched.
    pub fn release(&self, slot: SlotRef) -> Result<bool> {
        let meta = self.check(slot, SlotState::InFlight, "release")?;
        let previous = meta
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs_readers_of(refs) == 0 {
                    None
                } else {
                    Some(refs - 1)
                }
            })
            .map_err(|_| {
                SeuratError::corrupted(format!("release of slot {} without references", slot.index))
            })?;

        if previous == 1 {
            self.reclaim(slot.index, meta);
            return Ok(true);
        }
        Ok(false)
    }

    /// Give an unsent loan back
    pub fn discard(&self, slot: SlotRef) -> Result<()> {
        let meta = self.check(slot, SlotState::Writing, "discard")?;
        self.reclaim(slot.index, meta);
        Ok(())
    }

    /// Drop the writer's hold on an in-flight slot once fan-out is done.
    /// Returns `true` when no reader took the sample and the slot went back
    /// to the free list.
    pub fn finish_send(&self, slot: SlotRef) -> Result<bool> {
        let meta = self.check(slot, SlotState::InFlight, "finish_send")?;
        let previous = meta
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                if refs_writer_of(refs) == 0 {
                    None
                } else {
                    Some(refs & REFS_READERS_MASK)
                }
            })
            .map_err(|_| {
                SeuratError::corrupted(format!("finish_send of slot {} without a writer", slot.index))
            })?;

        if refs_readers_of(previous) == 0 {
            self.reclaim(slot.index, meta);
            return Ok(true);
        }
        Ok(false)
    }

    /// Reclaim every slot still held by publisher entry `writer`.
    ///
    /// Loans being written are discarded; slots the writer was in the middle
    /// of sending lose the writer's hold and stay with their readers. Returns
    /// the number of slots that went back to the free list.
    pub fn reclaim_writer(&self, writer: u32) -> usize {
        let mark = writer + 1;
        let mut reclaimed = 0;

        for (index, meta) in self.metas.iter().enumerate() {
            if meta.writer() != mark {
                continue;
            }

            match meta.state() {
                SlotState::Writing => {
                    if meta
                        .state
                        .compare_exchange(
                            SlotState::Writing.as_raw(),
                            SlotState::Free.as_raw(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.reclaim(index as u32, meta);
                        reclaimed += 1;
                    }
                }
                SlotState::InFlight => {
                    let previous = meta
                        .refs
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                            if refs_writer_of(refs) == mark {
                                Some(refs & REFS_READERS_MASK)
                            } else {
                                None
                            }
                        });
                    if matches!(previous, Ok(refs) if refs_readers_of(refs) == 0) {
                        self.reclaim(index as u32, meta);
                        reclaimed += 1;
                    }
                }
                SlotState::Free => {}
            }
        }

        if reclaimed > 0 {
            self.header
                .slots_reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }

    /// Drop `count` reader references held by a dead endpoint, ignoring the
    /// generation. Returns `true` when the slot was reclaimed.
    pub fn force_release(&self, index: u32, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        let meta = match self.meta(index) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        if meta.state() != SlotState::InFlight {
            warn!("Force release of slot {} in state {:?} ignored", index, meta.state());
            return false;
        }

        let previous = meta
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                let readers = refs_readers_of(refs);
                if readers == 0 {
                    None
                } else {
                    Some((refs & !REFS_READERS_MASK) | readers.saturating_sub(count) as u64)
                }
            });

        match previous {
            Ok(previous) if refs_writer_of(previous) == 0 && refs_readers_of(previous) <= count => {
                self.reclaim(index, meta);
                true
            }
            _ => false,
        }
    }

    /// Snapshot slot states and lifetime counters
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            capacity: self.metas.len(),
            samples_sent: self.header.samples_sent.load(Ordering::Relaxed),
            samples_dropped: self.header.samples_dropped.load(Ordering::Relaxed),
            slots_reclaimed: self.header.slots_reclaimed.load(Ordering::Relaxed),
            ..Default::default()
        };

        for meta in self.metas {
            match meta.state() {
                SlotState::Free => stats.free += 1,
                SlotState::Writing => stats.writing += 1,
                SlotState::InFlight => stats.in_flight += 1,
            }
        }
        stats
    }
}
