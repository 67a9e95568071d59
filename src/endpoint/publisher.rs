//! Publisher endpoint

use std::sync::atomic::{fence, AtomicU64, Ordering};

use log::{debug, info, warn};

use crate::{
    domain::Domain,
    error::{ErrorKind, Result, SeuratError},
    layout::{EndpointEntry, EndpointKind, SampleHeader},
    liveness::now_nanos,
    memory::{Segment, SegmentHandle},
    pool::SlotRef,
    queue::SharedQueue,
    sync::{deadline_after, futex, wait_until},
    topic::{OverflowPolicy, TopicConfig},
};

use super::{sample::SampleMut, table::EndpointTable};

/// Outcome of handing one sample to one subscriber
enum Delivery {
    Queued,
    /// Queue full under `DropOldest` after eviction attempts, or the
    /// subscriber left
    Skipped,
    /// `Block` subscriber stayed full past the block timeout
    Blocked,
}

/// Writes samples into a topic's pool and hands them to subscribers
#[derive(Debug)]
pub struct Publisher {
    handle: SegmentHandle,
    entry: usize,
    endpoint_id: u64,
    config: TopicConfig,
    sequence: AtomicU64,
    disconnected: bool,
}

impl Publisher {
    /// Connect to `config.name` in `domain`, creating the topic if needed
    pub fn connect(domain: &Domain, config: TopicConfig) -> Result<Self> {
        config.validate()?;

        let handle = domain
            .segments()
            .open_or_create(domain.name(), &config.name, &config.segment_config())?;

        let table = EndpointTable::new(&handle);
        let entry = table.claim(EndpointKind::Publisher, config.overflow_policy.as_raw())?;
        let endpoint_id = table.entry(entry).endpoint_id.load(Ordering::Acquire);
        table.activate(entry);

        info!(
            "Publisher {} connected to {} (entry {})",
            endpoint_id,
            handle.name(),
            entry
        );

        Ok(Self {
            handle,
            entry,
            endpoint_id,
            config,
            sequence: AtomicU64::new(0),
            disconnected: false,
        })
    }

    /// Segment-unique identifier, carried in every sample header
    pub fn id(&self) -> u64 {
        self.endpoint_id
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.handle
    }

    /// Number of currently connected subscribers
    pub fn subscriber_count(&self) -> usize {
        EndpointTable::new(&self.handle).count_active(EndpointKind::Subscriber)
    }

    /// Loan a free slot to write in place.
    ///
    /// Under `DropOldest` an exhausted pool fails with `NoSpace`; under
    /// `Block` the call waits for a slot up to the block timeout.
    pub fn loan(&self) -> Result<SampleMut<'_>> {
        self.check_owned()?;
        let pool = self.handle.pool();
        let writer = self.entry as u32;

        let slot = match self.config.overflow_policy {
            OverflowPolicy::DropOldest => pool.acquire(writer)?,
            OverflowPolicy::Block => {
                let deadline = deadline_after(Some(self.config.block_timeout));
                wait_until(pool.slot_signal(), deadline, || match pool.acquire(writer) {
                    Ok(slot) => Ok(Some(slot)),
                    Err(e) if e.kind() == ErrorKind::NoSpace => Ok(None),
                    Err(e) => Err(e),
                })?
                .ok_or_else(|| SeuratError::timeout("loan", self.config.block_timeout))?
            }
        };

        SampleMut::new(self, slot).map_err(|e| {
            if let Err(discard) = pool.discard(slot) {
                warn!("Returning slot {} after a failed loan failed: {}", slot.index, discard);
            }
            e
        })
    }

    /// Copy `bytes` into a loaned slot and send it
    pub fn send_copy(&self, bytes: &[u8]) -> Result<usize> {
        let mut sample = self.loan()?;
        sample.write(bytes)?;
        self.send(sample)
    }

    /// Send a plain-old-data value
    pub fn send_pod<T: bytemuck::Pod>(&self, value: &T) -> Result<usize> {
        let mut sample = self.loan()?;
        sample.write_pod(value)?;
        self.send(sample)
    }

    /// Publish a loaned sample to every active subscriber.
    ///
    /// Returns the number of subscribers the sample was queued for. When a
    /// `Block` subscriber stays full past the block timeout the remaining
    /// subscribers still receive the sample and the call fails with
    /// `Timeout`.
    pub fn send(&self, sample: SampleMut<'_>) -> Result<usize> {
        let (slot, len) = sample.take();
        let segment: &Segment = &self.handle;
        let pool = segment.pool();
        let table = EndpointTable::new(segment);

        let slot_header = match segment.sample_header(slot.index) {
            Ok(slot_header) => slot_header,
            Err(e) => {
                let _ = pool.discard(slot);
                return Err(e);
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let checksum = if segment.header().has_checksums() {
            let payload = segment.payload(slot.index)?;
            crc32fast::hash(unsafe { std::slice::from_raw_parts(payload, len) })
        } else {
            0
        };

        unsafe {
            slot_header.write(SampleHeader {
                publisher_id: self.endpoint_id,
                sequence,
                timestamp: now_nanos(),
                len: len as u32,
                checksum,
            });
        }

        pool.publish(slot)?;

        let mut delivered = 0;
        let mut blocked = None;
        let mut failure = None;
        for (index, entry) in table.active_consumers() {
            match self.deliver(segment, &table, index, entry, slot) {
                Ok(Delivery::Queued) => {
                    delivered += 1;
                    futex::signal(&entry.data_signal);
                }
                Ok(Delivery::Skipped) => {}
                Ok(Delivery::Blocked) => blocked = Some(index),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Readers may have released already; this drops the last hold then.
        pool.finish_send(slot)?;
        if let Some(e) = failure {
            return Err(e);
        }

        let header = segment.header();
        header.samples_sent.fetch_add(1, Ordering::Relaxed);
        let own = table.entry(self.entry);
        own.counter.fetch_add(1, Ordering::Relaxed);
        own.peers.store(delivered as u32, Ordering::Relaxed);
        table.heartbeat(self.entry);

        if let Some(index) = blocked {
            warn!(
                "Publisher {} timed out waiting for subscriber entry {} on {}",
                self.endpoint_id,
                index,
                segment.name()
            );
            return Err(SeuratError::timeout(
                format!("send to a full subscriber queue on {}", segment.name()),
                self.config.block_timeout,
            ));
        }

        Ok(delivered)
    }

    fn deliver(
        &self,
        segment: &Segment,
        table: &EndpointTable<'_>,
        index: usize,
        entry: &EndpointEntry,
        slot: SlotRef,
    ) -> Result<Delivery> {
        let pool = segment.pool();
        let queue = segment.queue(table.consumer_slot(index))?;
        let value = slot.pack();

        let queued = match OverflowPolicy::from_raw(entry.policy.load(Ordering::Acquire)) {
            OverflowPolicy::DropOldest => {
                pool.retain(slot)?;
                let mut queued = queue.push(value);
                let mut attempts = 0;
                while !queued && attempts <= queue.capacity() {
                    attempts += 1;
                    if let Some(oldest) = queue.pop() {
                        self.drop_oldest(SlotRef::unpack(oldest));
                        entry.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    queued = queue.push(value);
                }
                if !queued {
                    pool.release(slot)?;
                }
                queued
            }
            OverflowPolicy::Block => {
                // The reader reference is only taken once the queue has room,
                // so nothing is held for this subscriber while waiting.
                let deadline = deadline_after(Some(self.config.block_timeout));
                let outcome = wait_until(&entry.space_signal, deadline, || {
                    if !entry.is_active() {
                        return Ok(Some(false));
                    }
                    if queue.len() >= queue.capacity() {
                        return Ok(None);
                    }
                    pool.retain(slot)?;
                    if queue.push(value) {
                        Ok(Some(true))
                    } else {
                        pool.release(slot)?;
                        Ok(None)
                    }
                })?;
                match outcome {
                    Some(queued) => queued,
                    None => return Ok(Delivery::Blocked),
                }
            }
        };

        if !queued {
            return Ok(Delivery::Skipped);
        }

        // Pairs with the fence between close and drain on the subscriber
        // side: either it drains our push or we see it closing.
        fence(Ordering::SeqCst);
        if !entry.is_active() {
            self.drain_abandoned(queue);
            return Ok(Delivery::Skipped);
        }
        Ok(Delivery::Queued)
    }

    /// Release whatever is left in the queue of a subscriber that closed
    fn drain_abandoned(&self, queue: SharedQueue<'_>) {
        let pool = self.handle.pool();
        let mut released = 0;
        while let Some(raw) = queue.pop() {
            released += 1;
            if let Err(e) = pool.release(SlotRef::unpack(raw)) {
                warn!("Releasing a sample queued for a closed subscriber failed: {}", e);
            }
        }
        if released > 0 {
            debug!(
                "Publisher {} released {} samples left for a closed subscriber",
                self.endpoint_id, released
            );
        }
    }

    fn drop_oldest(&self, slot: SlotRef) {
        let header = self.handle.header();
        header.samples_dropped.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.handle.pool().release(slot) {
            warn!("Dropping oldest sample in slot {} failed: {}", slot.index, e);
        }
    }

    fn check_owned(&self) -> Result<()> {
        if EndpointTable::new(&self.handle).owns(self.entry, self.endpoint_id) {
            Ok(())
        } else {
            Err(SeuratError::cancelled(format!(
                "publisher {} was reclaimed by a liveness sweep",
                self.endpoint_id
            )))
        }
    }

    /// Leave the topic, returning any slot still held as writer
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
                "Publisher {} entry already reclaimed, skipping detach",
                self.endpoint_id
            );
            self.handle.disown();
            return;
        }

        table.close(self.entry);
        let reclaimed = self.handle.pool().reclaim_writer(self.entry as u32);
        if reclaimed > 0 {
            debug!("Publisher {} returned {} slots", self.endpoint_id, reclaimed);
        }
        table.free(self.entry);
        debug!("Publisher {} disconnected from {}", self.endpoint_id, self.handle.name());
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.teardown();
    }
}
