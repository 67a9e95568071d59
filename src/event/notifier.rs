//! Notifier endpoint

use std::sync::atomic::Ordering;

use log::{debug, info};

use crate::{
    domain::Domain,
    endpoint::EndpointTable,
    error::{Result, SeuratError},
    layout::{EndpointKind, EVENT_WORD_BITS},
    memory::{Segment, SegmentHandle},
    sync::futex,
};

use super::config::{EventConfig, EventId};

/// Wakes the listeners of an event service
#[derive(Debug)]
pub struct Notifier {
    handle: SegmentHandle,
    entry: usize,
    endpoint_id: u64,
    config: EventConfig,
    disconnected: bool,
}

impl Notifier {
    /// Connect to the event service `config.name`, creating it if needed
    pub fn connect(domain: &Domain, config: EventConfig) -> Result<Self> {
        let config = config.adjusted();
        config.validate()?;

        let handle = domain
            .segments()
            .open_or_create(domain.name(), &config.name, &config.segment_config())?;

        let table = EndpointTable::new(&handle);
        let entry = table.claim(EndpointKind::Notifier, 0)?;
        let endpoint_id = table.entry(entry).endpoint_id.load(Ordering::Acquire);
        table.activate(entry);

        info!(
            "Notifier {} connected to {} (entry {})",
            endpoint_id,
            handle.name(),
            entry
        );

        Ok(Self {
            handle,
            entry,
            endpoint_id,
            config,
            disconnected: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.endpoint_id
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Largest event id this service accepts; may exceed the configured one
    /// when the service was created by someone asking for more
    pub fn event_id_max(&self) -> usize {
        (self.handle.header().event_capacity as usize).saturating_sub(1)
    }

    /// Number of currently connected listeners
    pub fn listener_count(&self) -> usize {
        EndpointTable::new(&self.handle).count_active(EndpointKind::Listener)
    }

    /// Notify every listener with the configured default event id
    pub fn notify(&self) -> Result<usize> {
        self.notify_with_id(self.config.default_event_id)
    }

    /// Set `id` in every active listener's event set and wake it.
    ///
    /// Returns the number of listeners notified. Ids above
    /// [`Notifier::event_id_max`] fail with `InvalidParameter`.
    pub fn notify_with_id(&self, id: EventId) -> Result<usize> {
        self.check_owned()?;
        let segment: &Segment = &self.handle;
        if id.as_value() > self.event_id_max() {
            return Err(SeuratError::invalid_parameter(
                "event_id",
                format!(
                    "Event id {} is out of bounds for {} (largest is {})",
                    id,
                    segment.name(),
                    self.event_id_max()
                ),
            ));
        }

        let word = id.as_value() / EVENT_WORD_BITS;
        let bit = 1u64 << (id.as_value() % EVENT_WORD_BITS);
        let table = EndpointTable::new(segment);

        let mut notified = 0;
        for (index, entry) in table.active_consumers() {
            if entry.kind() != Some(EndpointKind::Listener) {
                continue;
            }
            let set = segment.event_set(table.consumer_slot(index))?;
            let target = set.get(word).ok_or_else(|| {
                SeuratError::corrupted(format!(
                    "Event set of {} has no word {}",
                    segment.name(),
                    word
                ))
            })?;
            target.fetch_or(bit, Ordering::AcqRel);
            futex::signal(&entry.data_signal);
            notified += 1;
        }

        let own = table.entry(self.entry);
        own.counter.fetch_add(1, Ordering::Relaxed);
        own.peers.store(notified as u32, Ordering::Relaxed);
        table.heartbeat(self.entry);
        Ok(notified)
    }

    fn check_owned(&self) -> Result<()> {
        if EndpointTable::new(&self.handle).owns(self.entry, self.endpoint_id) {
            Ok(())
        } else {
            Err(SeuratError::cancelled(format!(
                "notifier {} was reclaimed by a liveness sweep",
                self.endpoint_id
            )))
        }
    }

    /// Leave the service
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
            self.handle.disown();
            return;
        }

        table.close(self.entry);
        table.free(self.entry);
        debug!("Notifier {} disconnected from {}", self.endpoint_id, self.handle.name());
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.teardown();
    }
}
