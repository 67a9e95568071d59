//! Subscriber endpoint

use std::{
    sync::{
        atomic::{fence, AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    domain::Domain,
    error::{Result, SeuratError},
    layout::{EndpointKind, EntryState, SampleHeader},
    memory::{Segment, SegmentHandle},
    pool::SlotRef,
    sync::{deadline_after, futex, wait_until, Attachable},
    topic::TopicConfig,
};

use super::{sample::Sample, table::EndpointTable};

/// Receives references to samples published on a topic
#[derive(Debug)]
pub struct Subscriber {
    handle: SegmentHandle,
    entry: usize,
    queue_index: usize,
    endpoint_id: u64,
    config: TopicConfig,
    cancelled: Arc<AtomicBool>,
    disconnected: bool,
}

impl Subscriber {
    /// Connect to `config.name` in `domain`, creating the topic if needed.
    ///
    /// `config.overflow_policy` is stored in the shared entry and decides
    /// what every publisher does when this subscriber's queue is full.
    pub fn connect(domain: &Domain, config: TopicConfig) -> Result<Self> {
        config.validate()?;

        let handle = domain
            .segments()
            .open_or_create(domain.name(), &config.name, &config.segment_config())?;

        let table = EndpointTable::new(&handle);
        let entry = table.claim(EndpointKind::Subscriber, config.overflow_policy.as_raw())?;
        let queue_index = table.consumer_slot(entry);
        let endpoint_id = table.entry(entry).endpoint_id.load(Ordering::Acquire);

        // References a publisher pushed while a sweep was draining the
        // previous owner of this entry.
        let pool = handle.pool();
        let (queue, borrows) = match handle
            .queue(queue_index)
            .and_then(|queue| Ok((queue, handle.borrow_counts(queue_index)?)))
        {
            Ok(sections) => sections,
            Err(e) => {
                table.free(entry);
                return Err(e);
            }
        };
        let mut stale = 0;
        while let Some(raw) = queue.pop() {
            stale += 1;
            if let Err(e) = pool.release(SlotRef::unpack(raw)) {
                debug!("Stale queue reference rejected: {}", e);
            }
        }
        if stale > 0 {
            warn!("Released {} stale references left in {}", stale, handle.name());
        }
        for count in borrows {
            count.store(0, Ordering::Relaxed);
        }

        table.activate(entry);

        info!(
            "Subscriber {} connected to {} (entry {}, {})",
            endpoint_id,
            handle.name(),
            entry,
            config.overflow_policy.name()
        );

        Ok(Self {
            handle,
            entry,
            queue_index,
            endpoint_id,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            disconnected: false,
        })
    }

    /// Segment-unique identifier
    pub fn id(&self) -> u64 {
        self.endpoint_id
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.handle
    }

    /// Number of currently connected publishers
    pub fn publisher_count(&self) -> usize {
        EndpointTable::new(&self.handle).count_active(EndpointKind::Publisher)
    }

    /// Samples waiting in the queue
    pub fn pending(&self) -> usize {
        self.handle
            .queue(self.queue_index)
            .map_or(0, |queue| queue.len())
    }

    /// Handle that cancels this subscriber from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(
            Arc::clone(&self.cancelled),
            self.handle.shared(),
            self.entry,
            self.endpoint_id,
        )
    }

    fn check_usable(&self, operation: &str) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(SeuratError::cancelled(format!("{}: subscriber cancelled", operation)));
        }

        let table = EndpointTable::new(&self.handle);
        if !table.owns(self.entry, self.endpoint_id) || table.entry(self.entry).state() != EntryState::Active {
            return Err(SeuratError::cancelled(format!(
                "{}: subscriber {} is no longer registered",
                operation, self.endpoint_id
            )));
        }
        Ok(())
    }

    /// Take the next sample if one is queued; never blocks
    pub fn try_receive(&self) -> Result<Option<Sample<'_>>> {
        self.check_usable("try_receive")?;
        self.pop_sample()
    }

    /// Wait for a sample up to the configured receive timeout (forever when
    /// none is configured)
    pub fn receive(&self) -> Result<Sample<'_>> {
        self.receive_timeout(self.config.receive_timeout)
    }

    /// Wait for a sample up to `timeout` (`None` waits forever).
    ///
    /// Fails with `Timeout` when the deadline passes and with `Cancelled`
    /// when the subscriber is cancelled or reclaimed while waiting.
    pub fn receive_timeout(&self, timeout: Option<Duration>) -> Result<Sample<'_>> {
        let entry = EndpointTable::new(&self.handle).entry(self.entry);
        let deadline = deadline_after(timeout);

        let sample = wait_until(&entry.data_signal, deadline, || {
            self.check_usable("receive")?;
            self.pop_sample()
        })?;

        sample.ok_or_else(|| SeuratError::timeout("receive", timeout.unwrap_or_default()))
    }

    /// Release a sample explicitly; equivalent to dropping it
    pub fn release(&self, sample: Sample<'_>) -> Result<()> {
        sample.release()
    }

    fn pop_sample(&self) -> Result<Option<Sample<'_>>> {
        let segment: &Segment = &self.handle;
        let queue = segment.queue(self.queue_index)?;
        let raw = match queue.pop() {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let table = EndpointTable::new(segment);
        let entry = table.entry(self.entry);
        futex::signal(&entry.space_signal);

        let slot = SlotRef::unpack(raw);
        let (header, payload) = match self.read_slot(slot) {
            Ok(found) => found,
            Err(e) => {
                segment.header().mark_corrupted();
                return Err(e);
            }
        };
        if let Some(count) = segment.borrow_counts(self.queue_index)?.get(slot.index as usize) {
            count.fetch_add(1, Ordering::AcqRel);
        }
        let sample = Sample::new(self, slot, header, payload);

        if segment.header().has_checksums() {
            let actual = crc32fast::hash(sample.payload());
            if actual != header.checksum {
                return Err(SeuratError::corrupted(format!(
                    "Payload checksum mismatch in slot {} (expected {:#010x}, got {:#010x})",
                    slot.index, header.checksum, actual
                )));
            }
        }

        entry.counter.fetch_add(1, Ordering::Relaxed);
        table.heartbeat(self.entry);
        Ok(Some(sample))
    }

    /// Header and valid payload of a slot popped from the queue
    fn read_slot(&self, slot: SlotRef) -> Result<(SampleHeader, &[u8])> {
        let segment: &Segment = &self.handle;
        let header: SampleHeader = unsafe { segment.sample_header(slot.index)?.read() };
        let len = header.len as usize;
        if len > segment.payload_capacity() {
            return Err(SeuratError::corrupted(format!(
                "Slot {} of {} claims {} payload bytes, capacity is {}",
                slot.index,
                segment.name(),
                len,
                segment.payload_capacity()
            )));
        }
        let payload = segment.payload(slot.index)?;
        Ok((header, unsafe { std::slice::from_raw_parts(payload, len) }))
    }

    pub(crate) fn release_slot(&self, slot: SlotRef) -> Result<()> {
        let segment: &Segment = &self.handle;
        let borrows = segment.borrow_counts(self.queue_index)?;
        if let Some(count) = borrows.get(slot.index as usize) {
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        segment.pool().release(slot).map(|_| ())
    }

    /// Leave the topic, releasing everything still queued
    pub fn disconnect(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;

        let table = EndpointTable::new(&self.handle);
        if !table.owns(self.entry, self.endpoint_id) {
            debug!(
                "Subscriber {} entry already reclaimed, skipping detach",
                self.endpoint_id
            );
            self.handle.disown();
            return;
        }

        table.close(self.entry);
        let entry = table.entry(self.entry);
        futex::signal(&entry.space_signal);

        // Pairs with the fence after a publisher's push.
        fence(Ordering::SeqCst);
        let pool = self.handle.pool();
        let mut drained = 0;
        match self.handle.queue(self.queue_index) {
            Ok(queue) => {
                while let Some(raw) = queue.pop() {
                    drained += 1;
                    if let Err(e) = pool.release(SlotRef::unpack(raw)) {
                        warn!("Releasing queued slot on disconnect failed: {}", e);
                    }
                }
            }
            Err(e) => warn!("Subscriber {} cannot drain its queue: {}", self.endpoint_id, e),
        }

        table.free(self.entry);
        debug!(
            "Subscriber {} disconnected from {} ({} queued samples released)",
            self.endpoint_id,
            self.handle.name(),
            drained
        );
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Attachable for Subscriber {
    fn signal_word(&self) -> &AtomicU32 {
        &EndpointTable::new(&self.handle).entry(self.entry).data_signal
    }

    fn is_ready(&self) -> bool {
        self.check_usable("wait").is_err() || self.pending() > 0
    }
}

/// Cancels a subscriber or listener from another thread.
///
/// Cancelling stops delivery to the endpoint and wakes a suspended receive
/// or wait, which returns `Cancelled`. Every later call fails the same way;
/// drop or disconnect the endpoint to free its entry.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    segment: Arc<Segment>,
    entry: usize,
    endpoint_id: u64,
}

impl CancelHandle {
    pub(crate) fn new(
        cancelled: Arc<AtomicBool>,
        segment: Arc<Segment>,
        entry: usize,
        endpoint_id: u64,
    ) -> Self {
        Self {
            cancelled,
            segment,
            entry,
            endpoint_id,
        }
    }

    /// Cancel the endpoint
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let table = EndpointTable::new(&self.segment);
        let entry = table.entry(self.entry);
        if table.owns(self.entry, self.endpoint_id) {
            let _ = entry.state.compare_exchange(
                EntryState::Active.as_raw(),
                EntryState::Closing.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        futex::signal(&entry.data_signal);
        futex::signal(&entry.space_signal);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
