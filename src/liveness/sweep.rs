//! Reclaiming endpoints of crashed or hung processes

use std::{
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    endpoint::EndpointTable,
    error::Result,
    layout::{EndpointKind, EntryState},
    memory::Segment,
    pool::SlotRef,
};

use super::process::{age_of, current_pid, endpoint_alive, process_alive};

/// What a sweep reclaimed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub segments_scanned: usize,
    pub publishers_reclaimed: usize,
    pub subscribers_reclaimed: usize,
    pub notifiers_reclaimed: usize,
    pub listeners_reclaimed: usize,
    /// Slots that went back to the free list
    pub slots_reclaimed: usize,
    /// Reader references dropped on behalf of dead subscribers
    pub references_released: usize,
}

impl SweepReport {
    pub fn endpoints_reclaimed(&self) -> usize {
        self.publishers_reclaimed
            + self.subscribers_reclaimed
            + self.notifiers_reclaimed
            + self.listeners_reclaimed
    }

    pub fn merge(&mut self, other: &SweepReport) {
        self.segments_scanned += other.segments_scanned;
        self.publishers_reclaimed += other.publishers_reclaimed;
        self.subscribers_reclaimed += other.subscribers_reclaimed;
        self.notifiers_reclaimed += other.notifiers_reclaimed;
        self.listeners_reclaimed += other.listeners_reclaimed;
        self.slots_reclaimed += other.slots_reclaimed;
        self.references_released += other.references_released;
    }
}

/// Reclaim every endpoint of `segment` whose process is gone or whose
/// heartbeat is older than `heartbeat_timeout`.
///
/// Publisher loans are discarded, the references a subscriber held or had
/// queued are dropped, a listener's pending events are cleared, the entry is
/// freed and the dead process's attachment is dropped. Dropping the last
/// attachment of a non-persistent segment removes it. Entries of the calling
/// process are never touched.
pub fn sweep_segment(segment: &Segment, heartbeat_timeout: Option<Duration>) -> SweepReport {
    let mut report = SweepReport {
        segments_scanned: 1,
        ..Default::default()
    };
    let table = EndpointTable::new(segment);
    let own_pid = current_pid();

    for (index, entry) in table.occupied() {
        let pid = entry.pid.load(Ordering::Acquire);
        // A claim in progress has not published its pid yet.
        if pid == 0 || pid == own_pid {
            continue;
        }

        let dead = match entry.state() {
            EntryState::Claimed => !process_alive(pid),
            _ => !endpoint_alive(pid, entry.heartbeat.load(Ordering::Acquire), heartbeat_timeout),
        };
        if !dead {
            continue;
        }

        // Take the entry over; a concurrent sweeper that won already did it.
        if entry
            .pid
            .compare_exchange(pid, own_pid, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }

        let id = entry.endpoint_id.load(Ordering::Acquire);
        let kind = entry.kind();
        let heartbeat_age = age_of(entry.heartbeat.load(Ordering::Relaxed));
        table.close(index);

        // Wake producers blocked on this entry; they see it closing.
        crate::sync::futex::signal(&entry.space_signal);
        fence(Ordering::SeqCst);

        match kind {
            Some(EndpointKind::Publisher) => {
                report.slots_reclaimed += segment.pool().reclaim_writer(index as u32);
                report.publishers_reclaimed += 1;
            }
            Some(EndpointKind::Subscriber) => {
                if let Err(e) = reclaim_subscriber(segment, &table, index, &mut report) {
                    warn!("Subscriber entry {} of {}: {}", index, segment.name(), e);
                }
                report.subscribers_reclaimed += 1;
            }
            Some(EndpointKind::Notifier) => report.notifiers_reclaimed += 1,
            Some(EndpointKind::Listener) => {
                match segment.event_set(table.consumer_slot(index)) {
                    Ok(set) => set.iter().for_each(|word| word.store(0, Ordering::Relaxed)),
                    Err(e) => warn!("Listener entry {} of {}: {}", index, segment.name(), e),
                }
                report.listeners_reclaimed += 1;
            }
            None => warn!("Endpoint entry {} of {} has no kind", index, segment.name()),
        }

        table.free(index);

        info!(
            "Reclaimed {} {} of pid {} on {} (last heartbeat {:?} ago)",
            kind.map_or("endpoint", |k| k.name()),
            id,
            pid,
            segment.name(),
            heartbeat_age
        );

        segment.detach();
    }

    report
}

fn reclaim_subscriber(
    segment: &Segment,
    table: &EndpointTable<'_>,
    index: usize,
    report: &mut SweepReport,
) -> Result<()> {
    let pool = segment.pool();
    let sub = table.consumer_slot(index);
    let mut freed = 0;

    let queue = segment.queue(sub)?;
    while let Some(raw) = queue.pop() {
        report.references_released += 1;
        match pool.release(SlotRef::unpack(raw)) {
            Ok(true) => freed += 1,
            Ok(false) => {}
            Err(e) => debug!("Queued reference of dead subscriber rejected: {}", e),
        }
    }

    for (slot, count) in segment.borrow_counts(sub)?.iter().enumerate() {
        let held = count.swap(0, Ordering::AcqRel);
        if held == 0 {
            continue;
        }
        report.references_released += held as usize;
        if pool.force_release(slot as u32, held) {
            freed += 1;
        }
    }

    if freed > 0 {
        segment
            .header()
            .slots_reclaimed
            .fetch_add(freed as u64, Ordering::Relaxed);
    }
    report.slots_reclaimed += freed;
    Ok(())
}
