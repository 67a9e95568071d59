//! Endpoint table: producer and consumer registrations of one segment

use std::sync::atomic::Ordering;

use crate::{
    error::{Result, SeuratError},
    layout::{EndpointEntry, EndpointKind, EntryState, SegmentHeader},
    liveness::{current_pid, now_nanos},
    memory::Segment,
};

/// View over the endpoint entries of a segment.
///
/// Producers (publishers or notifiers) occupy indices `0..max_publishers`,
/// consumers (subscribers or listeners) the rest.
#[derive(Clone, Copy)]
pub struct EndpointTable<'a> {
    header: &'a SegmentHeader,
    entries: &'a [EndpointEntry],
    max_publishers: usize,
}

impl<'a> EndpointTable<'a> {
    pub fn new(segment: &'a Segment) -> Self {
        Self {
            header: segment.header(),
            entries: segment.endpoints(),
            max_publishers: segment.layout().params.max_publishers,
        }
    }

    fn range(&self, kind: EndpointKind) -> std::ops::Range<usize> {
        if kind.is_producer() {
            0..self.max_publishers
        } else {
            self.max_publishers..self.entries.len()
        }
    }

    pub fn entry(&self, index: usize) -> &'a EndpointEntry {
        &self.entries[index]
    }

    /// Position of a consumer entry among consumers
    pub fn consumer_slot(&self, index: usize) -> usize {
        index - self.max_publishers
    }

    /// Reserve a free entry for this process. The entry stays `Claimed`
    /// (invisible to peers) until [`EndpointTable::activate`].
    pub fn claim(&self, kind: EndpointKind, policy: u32) -> Result<usize> {
        for index in self.range(kind) {
            let entry = &self.entries[index];
            if entry
                .state
                .compare_exchange(
                    EntryState::Free.as_raw(),
                    EntryState::Claimed.as_raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }

            let now = now_nanos();
            entry.pid.store(current_pid(), Ordering::Relaxed);
            entry.kind.store(kind.as_raw(), Ordering::Relaxed);
            entry.policy.store(policy, Ordering::Relaxed);
            entry.endpoint_id.store(
                self.header.next_endpoint_id.fetch_add(1, Ordering::Relaxed),
                Ordering::Relaxed,
            );
            entry.heartbeat.store(now, Ordering::Relaxed);
            entry.connected_at.store(now, Ordering::Relaxed);
            entry.counter.store(0, Ordering::Relaxed);
            entry.dropped.store(0, Ordering::Relaxed);
            entry.peers.store(0, Ordering::Release);
            return Ok(index);
        }

        let range = self.range(kind);
        Err(SeuratError::resource_exhausted(
            format!("{} endpoints", kind.name()),
            format!("All {} {} entries are in use", range.len(), kind.name()),
        ))
    }

    /// Make a claimed entry visible to peers
    pub fn activate(&self, index: usize) {
        self.entries[index]
            .state
            .store(EntryState::Active.as_raw(), Ordering::Release);
    }

    /// Begin tearing an entry down; publishers stop delivering to it
    pub fn close(&self, index: usize) {
        self.entries[index]
            .state
            .store(EntryState::Closing.as_raw(), Ordering::Release);
    }

    /// Return an entry to the free pool
    pub fn free(&self, index: usize) {
        let entry = &self.entries[index];
        entry.kind.store(0, Ordering::Relaxed);
        entry.pid.store(0, Ordering::Relaxed);
        entry.endpoint_id.store(0, Ordering::Relaxed);
        entry
            .state
            .store(EntryState::Free.as_raw(), Ordering::Release);
    }

    /// Check that entry `index` is still the registration `endpoint_id` of
    /// this process, i.e. no sweep took it over
    pub fn owns(&self, index: usize, endpoint_id: u64) -> bool {
        let entry = &self.entries[index];
        entry.state() != EntryState::Free
            && entry.pid.load(Ordering::Acquire) == current_pid()
            && entry.endpoint_id.load(Ordering::Acquire) == endpoint_id
    }

    pub fn heartbeat(&self, index: usize) {
        self.entries[index]
            .heartbeat
            .store(now_nanos(), Ordering::Relaxed);
    }

    /// Active consumers as `(entry index, entry)`
    pub fn active_consumers(&self) -> impl Iterator<Item = (usize, &'a EndpointEntry)> + 'a {
        let start = self.max_publishers;
        self.entries[start..]
            .iter()
            .enumerate()
            .map(move |(i, entry)| (start + i, entry))
            .filter(|(_, entry)| entry.is_active())
    }

    /// Count active entries of a kind
    pub fn count_active(&self, kind: EndpointKind) -> usize {
        self.entries[self.range(kind)]
            .iter()
            .filter(|entry| entry.is_active() && entry.kind() == Some(kind))
            .count()
    }

    /// Every non-free entry as `(index, entry)`
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &'a EndpointEntry)> + 'a {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.state() != EntryState::Free)
    }

    /// Refresh the heartbeat of every entry owned by this process
    pub fn refresh_own(&self) -> usize {
        let pid = current_pid();
        let now = now_nanos();
        let mut refreshed = 0;
        for entry in self.entries {
            if entry.state() == EntryState::Active && entry.pid.load(Ordering::Acquire) == pid {
                entry.heartbeat.store(now, Ordering::Relaxed);
                refreshed += 1;
            }
        }
        refreshed
    }
}
