//! Listener endpoint

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, info};

use crate::{
    domain::Domain,
    endpoint::{CancelHandle, EndpointTable},
    error::{Result, SeuratError},
    layout::{EndpointKind, EntryState, EVENT_WORD_BITS},
    memory::SegmentHandle,
    sync::{deadline_after, wait_until, Attachable},
};

use super::config::{EventConfig, EventId};

/// Receives the event ids notifiers send to an event service
#[derive(Debug)]
pub struct Listener {
    handle: SegmentHandle,
    entry: usize,
    set_index: usize,
    endpoint_id: u64,
    config: EventConfig,
    cancelled: Arc<AtomicBool>,
    disconnected: bool,
}

impl Listener {
    /// Connect to the event service `config.name`, creating it if needed
    pub fn connect(domain: &Domain, config: EventConfig) -> Result<Self> {
        let config = config.adjusted();
        config.validate()?;

        let handle = domain
            .segments()
            .open_or_create(domain.name(), &config.name, &config.segment_config())?;

        let table = EndpointTable::new(&handle);
        let entry = table.claim(EndpointKind::Listener, 0)?;
        let set_index = table.consumer_slot(entry);
        let endpoint_id = table.entry(entry).endpoint_id.load(Ordering::Acquire);

        // Bits a notifier set for the previous owner of this entry.
        match handle.event_set(set_index) {
            Ok(set) => set.iter().for_each(|word| word.store(0, Ordering::Relaxed)),
            Err(e) => {
                table.free(entry);
                return Err(e);
            }
        }

        table.activate(entry);

        info!(
            "Listener {} connected to {} (entry {})",
            endpoint_id,
            handle.name(),
            entry
        );

        Ok(Self {
            handle,
            entry,
            set_index,
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

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Number of currently connected notifiers
    pub fn notifier_count(&self) -> usize {
        EndpointTable::new(&self.handle).count_active(EndpointKind::Notifier)
    }

    /// Handle that cancels this listener from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle::new(
            Arc::clone(&self.cancelled),
            self.handle.shared(),
            self.entry,
            self.endpoint_id,
        )
    }

    /// Whether any event is pending
    pub fn has_pending(&self) -> bool {
        self.event_set()
            .map_or(false, |set| set.iter().any(|word| word.load(Ordering::Acquire) != 0))
    }

    fn event_set(&self) -> Result<&[AtomicU64]> {
        self.handle.event_set(self.set_index)
    }

    fn check_usable(&self, operation: &str) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(SeuratError::cancelled(format!("{}: listener cancelled", operation)));
        }

        let table = EndpointTable::new(&self.handle);
        if !table.owns(self.entry, self.endpoint_id)
            || table.entry(self.entry).state() != EntryState::Active
        {
            return Err(SeuratError::cancelled(format!(
                "{}: listener {} is no longer registered",
                operation, self.endpoint_id
            )));
        }
        Ok(())
    }

    /// Lowest pending event id, consumed
    fn take_one(&self) -> Result<Option<EventId>> {
        for (index, word) in self.event_set()?.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let mask = 1u64 << bit;
                let previous = word.fetch_and(!mask, Ordering::AcqRel);
                if previous & mask != 0 {
                    self.consumed(1);
                    return Ok(Some(EventId::new(index * EVENT_WORD_BITS + bit)));
                }
                bits = previous & !mask;
            }
        }
        Ok(None)
    }

    /// Every pending event id in ascending order, consumed
    fn take_all(&self, mut callback: impl FnMut(EventId)) -> Result<usize> {
        let mut taken = 0;
        for (index, word) in self.event_set()?.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                taken += 1;
                callback(EventId::new(index * EVENT_WORD_BITS + bit));
            }
        }
        self.consumed(taken);
        Ok(taken)
    }

    fn consumed(&self, count: usize) {
        if count == 0 {
            return;
        }
        let table = EndpointTable::new(&self.handle);
        table
            .entry(self.entry)
            .counter
            .fetch_add(count as u64, Ordering::Relaxed);
        table.heartbeat(self.entry);
    }

    fn wait_for<T>(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        mut take: impl FnMut() -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let entry = EndpointTable::new(&self.handle).entry(self.entry);
        wait_until(&entry.data_signal, deadline_after(timeout), || {
            self.check_usable(operation)?;
            take()
        })
    }

    /// Take the lowest pending event id; never blocks
    pub fn try_wait_one(&self) -> Result<Option<EventId>> {
        self.check_usable("try_wait_one")?;
        self.take_one()
    }

    /// Wait up to `timeout` for an event; `Ok(None)` once it passes
    pub fn timed_wait_one(&self, timeout: Duration) -> Result<Option<EventId>> {
        self.wait_for("timed_wait_one", Some(timeout), || self.take_one())
    }

    /// Wait until an event arrives or the listener is cancelled
    pub fn blocking_wait_one(&self) -> Result<EventId> {
        self.wait_for("blocking_wait_one", None, || self.take_one())?
            .ok_or_else(|| SeuratError::cancelled("blocking_wait_one"))
    }

    /// Hand every pending event id to `callback`; never blocks.
    ///
    /// Returns how many ids were handed out.
    pub fn try_wait_all(&self, callback: impl FnMut(EventId)) -> Result<usize> {
        self.check_usable("try_wait_all")?;
        self.take_all(callback)
    }

    /// Wait up to `timeout` for at least one event, then hand out every
    /// pending id. Returns 0 when the timeout passes.
    pub fn timed_wait_all(&self, timeout: Duration, callback: impl FnMut(EventId)) -> Result<usize> {
        self.wait_all("timed_wait_all", Some(timeout), callback)
    }

    /// Wait for at least one event, then hand out every pending id
    pub fn blocking_wait_all(&self, callback: impl FnMut(EventId)) -> Result<usize> {
        self.wait_all("blocking_wait_all", None, callback)
    }

    fn wait_all(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        mut callback: impl FnMut(EventId),
    ) -> Result<usize> {
        let taken = self.wait_for(operation, timeout, || {
            let taken = self.take_all(&mut callback)?;
            Ok(if taken > 0 { Some(taken) } else { None })
        })?;
        Ok(taken.unwrap_or(0))
    }

    /// Leave the service, discarding pending events
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
                "Listener {} entry already reclaimed, skipping detach",
                self.endpoint_id
            );
            self.handle.disown();
            return;
        }

        table.close(self.entry);
        if let Ok(set) = self.event_set() {
            set.iter().for_each(|word| word.store(0, Ordering::Relaxed));
        }
        table.free(self.entry);
        debug!("Listener {} disconnected from {}", self.endpoint_id, self.handle.name());
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Attachable for Listener {
    fn signal_word(&self) -> &AtomicU32 {
        &EndpointTable::new(&self.handle).entry(self.entry).data_signal
    }

    fn is_ready(&self) -> bool {
        self.check_usable("wait").is_err() || self.has_pending()
    }
}
