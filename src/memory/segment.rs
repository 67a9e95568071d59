//! Typed access to a mapped segment and attachment handles

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, warn};

use crate::{
    error::{Result, SeuratError},
    layout::{
        EndpointEntry, QueueCell, QueueHeader, SampleHeader, SegmentHeader, SegmentLayout,
        SegmentState, SlotMeta, StaticInfo,
    },
    pool::SamplePool,
    queue::SharedQueue,
};

use super::region::SharedMemoryRegion;

/// A mapped, ready segment
#[derive(Debug)]
pub struct Segment {
    region: SharedMemoryRegion,
    layout: SegmentLayout,
    info: StaticInfo,
    domain_dir: PathBuf,
}

impl Segment {
    /// Wrap a region whose header is `Ready` (or being initialized by us)
    pub(crate) fn new(
        region: SharedMemoryRegion,
        layout: SegmentLayout,
        info: StaticInfo,
        domain_dir: PathBuf,
    ) -> Result<Self> {
        if region.size() < layout.total_size {
            return Err(SeuratError::corrupted(format!(
                "Segment {} is {} bytes, layout needs {}",
                region.path().display(),
                region.size(),
                layout.total_size
            )));
        }
        Ok(Self {
            region,
            layout,
            info,
            domain_dir,
        })
    }

    /// `domain/topic`
    pub fn name(&self) -> String {
        format!("{}/{}", self.info.domain, self.info.topic)
    }

    pub fn domain(&self) -> &str {
        &self.info.domain
    }

    pub fn topic(&self) -> &str {
        &self.info.topic
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    pub fn info(&self) -> &StaticInfo {
        &self.info
    }

    pub(crate) fn region_linked(&self) -> bool {
        self.region.is_linked()
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    unsafe fn at<T>(&self, offset: usize) -> *mut T {
        self.region.as_ptr().add(offset) as *mut T
    }

    /// All endpoint table entries, publishers first
    pub fn endpoints(&self) -> &[EndpointEntry] {
        unsafe {
            std::slice::from_raw_parts(
                self.at::<EndpointEntry>(self.layout.endpoints_offset),
                self.layout.endpoint_count(),
            )
        }
    }

    pub fn slot_metas(&self) -> &[SlotMeta] {
        unsafe {
            std::slice::from_raw_parts(
                self.at::<SlotMeta>(self.layout.slot_meta_offset),
                self.layout.params.slot_count,
            )
        }
    }

    pub fn pool(&self) -> SamplePool<'_> {
        SamplePool::new(self.header(), self.slot_metas())
    }

    fn check_consumer(&self, sub: usize, section: &str) -> Result<()> {
        let max = self.layout.params.max_subscribers;
        if sub >= max {
            return Err(SeuratError::corrupted(format!(
                "{} of consumer {} out of range for {} ({} consumers)",
                section,
                sub,
                self.name(),
                max
            )));
        }
        Ok(())
    }

    fn check_slot(&self, index: u32) -> Result<()> {
        let count = self.layout.params.slot_count;
        if index as usize >= count {
            return Err(SeuratError::corrupted(format!(
                "Slot {} out of range for {} ({} slots)",
                index,
                self.name(),
                count
            )));
        }
        Ok(())
    }

    /// Per-slot counts of samples subscriber `sub` holds outside its queue
    pub fn borrow_counts(&self, sub: usize) -> Result<&[AtomicU32]> {
        self.check_consumer(sub, "Borrow counts")?;
        Ok(unsafe {
            std::slice::from_raw_parts(
                self.at::<AtomicU32>(self.layout.borrow_row_offset(sub)),
                self.layout.params.slot_count,
            )
        })
    }

    /// Delivery queue of subscriber `sub`
    pub fn queue(&self, sub: usize) -> Result<SharedQueue<'_>> {
        self.check_consumer(sub, "Queue")?;
        if self.layout.params.queue_capacity == 0 {
            return Err(SeuratError::corrupted(format!(
                "{} has no subscriber queues",
                self.name()
            )));
        }
        let offset = self.layout.queue_offset(sub);
        Ok(unsafe {
            let header = &*self.at::<QueueHeader>(offset);
            let cells = std::slice::from_raw_parts(
                self.at::<QueueCell>(offset + std::mem::size_of::<QueueHeader>()),
                self.layout.params.queue_capacity,
            );
            SharedQueue::new(header, cells)
        })
    }

    /// Pending event bits of listener `sub`
    pub fn event_set(&self, sub: usize) -> Result<&[AtomicU64]> {
        self.check_consumer(sub, "Event set")?;
        Ok(unsafe {
            std::slice::from_raw_parts(
                self.at::<AtomicU64>(self.layout.event_set_offset(sub)),
                self.layout.params.event_words(),
            )
        })
    }

    /// Sample header of slot `index`
    pub(crate) fn sample_header(&self, index: u32) -> Result<*mut SampleHeader> {
        self.check_slot(index)?;
        Ok(unsafe { self.at(self.layout.slot_offset(index as usize)) })
    }

    /// Payload of slot `index`
    pub(crate) fn payload(&self, index: u32) -> Result<*mut u8> {
        self.check_slot(index)?;
        Ok(unsafe { self.at(self.layout.slot_offset(index as usize) + self.layout.payload_offset) })
    }

    pub fn payload_capacity(&self) -> usize {
        self.layout.params.payload_size
    }

    /// Detach once: drop the attachment count and unlink the file when this
    /// was the last attachment of a non-persistent segment. Liveness sweeps
    /// call this on behalf of the dead process whose endpoint they reclaim.
    pub(crate) fn detach(&self) {
        let header = self.header();
        let previous = header
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Err(_) => warn!("Segment {} detached with zero attachments", self.name()),
            Ok(1) if !header.is_persistent() => self.destroy_if_unused(),
            Ok(_) => {}
        }
    }

    fn destroy_if_unused(&self) {
        let header = self.header();
        if header
            .state
            .compare_exchange(
                SegmentState::Ready.as_raw(),
                SegmentState::Destroying.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        // An opener may have attached between the decrement and the CAS.
        if header.attached.load(Ordering::Acquire) != 0 {
            header
                .state
                .store(SegmentState::Ready.as_raw(), Ordering::Release);
            return;
        }

        if self.region.is_linked() {
            if let Err(e) = std::fs::remove_file(self.path()) {
                warn!("Failed to remove segment {}: {}", self.path().display(), e);
                return;
            }
        }
        debug!("Destroyed segment {}", self.name());

        // Fails while other topics live in the domain.
        let _ = std::fs::remove_dir(&self.domain_dir);
    }
}

/// One attachment to a segment.
///
/// Dropping the handle detaches; the last detach of a non-persistent segment
/// removes its file.
#[derive(Debug)]
pub struct SegmentHandle {
    segment: Arc<Segment>,
    closed: bool,
}

impl SegmentHandle {
    /// Wrap a segment whose attachment count already includes this handle
    pub(crate) fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            closed: false,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// The shared mapping, without an attachment
    pub(crate) fn shared(&self) -> Arc<Segment> {
        Arc::clone(&self.segment)
    }

    /// Give up the attachment without decrementing the count, for handles
    /// whose endpoint a liveness sweep already accounted for
    pub(crate) fn disown(&mut self) {
        self.closed = true;
    }

    /// Detach now
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.closed {
            self.closed = true;
            self.segment.detach();
        }
    }
}

impl std::ops::Deref for SegmentHandle {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
