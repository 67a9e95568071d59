//! Loaned and received samples

use std::{mem::size_of, ops::Deref};

use bytemuck::Pod;
use log::error;

use crate::{
    error::{Result, SeuratError},
    layout::SampleHeader,
    pool::SlotRef,
};

use super::{publisher::Publisher, subscriber::Subscriber};

/// A slot loaned to a publisher for writing in place.
///
/// Dropping an unsent sample gives the slot back to the pool.
pub struct SampleMut<'a> {
    publisher: &'a Publisher,
    slot: SlotRef,
    data: *mut u8,
    capacity: usize,
    len: usize,
    sent: bool,
}

// The slot is loaned exclusively to this sample until it is sent or dropped.
unsafe impl Send for SampleMut<'_> {}

impl<'a> SampleMut<'a> {
    pub(crate) fn new(publisher: &'a Publisher, slot: SlotRef) -> Result<Self> {
        let segment = publisher.segment();
        Ok(Self {
            publisher,
            slot,
            data: segment.payload(slot.index)?,
            capacity: segment.payload_capacity(),
            len: 0,
            sent: false,
        })
    }

    pub fn slot(&self) -> SlotRef {
        self.slot
    }

    /// Bytes available in the slot
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that will be sent
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole slot, for writing in place; follow with [`SampleMut::set_len`]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.capacity) }
    }

    /// The bytes written so far
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// Set how many bytes of the slot are sent
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(SeuratError::invalid_parameter(
                "len",
                format!("Length {} exceeds slot capacity {}", len, self.capacity()),
            ));
        }
        self.len = len;
        Ok(())
    }

    /// Copy `bytes` into the slot and set the length
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.set_len(bytes.len())?;
        self.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy a plain-old-data value into the slot
    pub fn write_pod<T: Pod>(&mut self, value: &T) -> Result<()> {
        self.write(bytemuck::bytes_of(value))
    }

    /// View the slot as a `T` to fill in place; sets the length to
    /// `size_of::<T>()`
    pub fn as_pod_mut<T: Pod>(&mut self) -> Result<&mut T> {
        self.set_len(size_of::<T>())?;
        bytemuck::try_from_bytes_mut(&mut self.payload_mut()[..size_of::<T>()])
            .map_err(|e| SeuratError::invalid_parameter("type", format!("Cannot view slot: {}", e)))
    }

    /// Send to every connected subscriber; see [`Publisher::send`]
    pub fn send(self) -> Result<usize> {
        self.publisher.send(self)
    }

    /// Hand the slot to the send path; drop no longer discards it
    pub(crate) fn take(mut self) -> (SlotRef, usize) {
        self.sent = true;
        (self.slot, self.len)
    }
}

impl Drop for SampleMut<'_> {
    fn drop(&mut self) {
        if !self.sent {
            if let Err(e) = self.publisher.segment().pool().discard(self.slot) {
                error!("Failed to return unsent slot {}: {}", self.slot.index, e);
            }
        }
    }
}

impl std::fmt::Debug for SampleMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleMut")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .finish()
    }
}

/// A received sample, read in place.
///
/// The slot stays allocated until every subscriber holding it released it;
/// dropping the sample releases this subscriber's reference.
pub struct Sample<'a> {
    subscriber: &'a Subscriber,
    slot: SlotRef,
    header: SampleHeader,
    payload: &'a [u8],
    released: bool,
}

impl<'a> Sample<'a> {
    pub(crate) fn new(
        subscriber: &'a Subscriber,
        slot: SlotRef,
        header: SampleHeader,
        payload: &'a [u8],
    ) -> Self {
        Self {
            subscriber,
            slot,
            header,
            payload,
            released: false,
        }
    }

    pub fn slot(&self) -> SlotRef {
        self.slot
    }

    /// Endpoint id of the publisher that sent the sample
    pub fn publisher_id(&self) -> u64 {
        self.header.publisher_id
    }

    /// Per-publisher sequence number, starting at 1
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Send time in nanoseconds since the UNIX epoch
    pub fn timestamp_nanos(&self) -> u64 {
        self.header.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// View the payload as a `T`
    pub fn as_pod<T: Pod>(&self) -> Result<&T> {
        let payload = self.payload();
        if payload.len() < size_of::<T>() {
            return Err(SeuratError::invalid_parameter(
                "type",
                format!(
                    "Sample has {} bytes, {} needed",
                    payload.len(),
                    size_of::<T>()
                ),
            ));
        }
        bytemuck::try_from_bytes(&payload[..size_of::<T>()])
            .map_err(|e| SeuratError::invalid_parameter("type", format!("Cannot view sample: {}", e)))
    }

    /// Copy a plain-old-data value out of the payload
    pub fn read_pod<T: Pod>(&self) -> Result<T> {
        let payload = self.payload();
        if payload.len() < size_of::<T>() {
            return Err(SeuratError::invalid_parameter(
                "type",
                format!("Sample has {} bytes, {} needed", payload.len(), size_of::<T>()),
            ));
        }
        Ok(bytemuck::pod_read_unaligned(&payload[..size_of::<T>()]))
    }

    /// Release now, reporting errors that drop would only log
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.subscriber.release_slot(self.slot)
    }
}

impl Deref for Sample<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload()
    }
}

impl Drop for Sample<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.subscriber.release_slot(self.slot) {
                error!("Failed to release slot {}: {}", self.slot.index, e);
            }
        }
    }
}

impl std::fmt::Debug for Sample<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("slot", &self.slot)
            .field("publisher_id", &self.header.publisher_id)
            .field("sequence", &self.header.sequence)
            .field("len", &self.header.len)
            .finish()
    }
}
