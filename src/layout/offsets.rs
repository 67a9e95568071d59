//! Section offsets of a segment

use std::mem::size_of;

use crate::error::{Result, SeuratError};

use super::{
    constants::{CACHE_LINE_SIZE, EVENT_WORD_BITS, STATIC_INFO_CAPACITY},
    headers::{EndpointEntry, QueueCell, QueueHeader, SampleHeader, SegmentHeader, SlotMeta},
};

/// Parameters that fully determine a segment's layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutParams {
    pub payload_size: usize,
    pub type_align: usize,
    pub slot_count: usize,
    pub max_publishers: usize,
    pub max_subscribers: usize,
    pub queue_capacity: usize,
    /// Distinct event ids per listener; 0 for publish-subscribe segments
    pub event_capacity: usize,
}

impl LayoutParams {
    /// 64-bit words in one listener's pending set
    pub fn event_words(&self) -> usize {
        (self.event_capacity + EVENT_WORD_BITS - 1) / EVENT_WORD_BITS
    }
}

/// Byte offsets of every section, in file order:
///
/// ```text
/// header | static info | endpoints | slot metas | borrow counts | queues | event sets | slot data
/// ```
///
/// Sections a segment does not use (queues and slots of an event segment,
/// event sets of a topic) are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub params: LayoutParams,
    pub static_info_offset: usize,
    pub endpoints_offset: usize,
    pub slot_meta_offset: usize,
    pub borrow_offset: usize,
    pub queues_offset: usize,
    pub queue_stride: usize,
    pub events_offset: usize,
    pub event_stride: usize,
    pub data_offset: usize,
    /// Offset of the payload inside one slot
    pub payload_offset: usize,
    /// Distance between two slots
    pub slot_stride: usize,
    pub total_size: usize,
}

/// Round `value` up to a multiple of `align` (a power of two)
fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

fn overflow() -> SeuratError {
    SeuratError::invalid_parameter("layout", "Segment size overflows the address space")
}

impl SegmentLayout {
    /// Compute the layout, rejecting parameter sets whose size overflows
    pub fn compute(params: LayoutParams) -> Result<Self> {
        let slot_align = params.type_align.max(CACHE_LINE_SIZE);
        if !slot_align.is_power_of_two() {
            return Err(SeuratError::invalid_parameter(
                "type_align",
                "Alignment must be a power of two",
            ));
        }

        let endpoint_count = params
            .max_publishers
            .checked_add(params.max_subscribers)
            .ok_or_else(overflow)?;

        let static_info_offset = size_of::<SegmentHeader>();
        let endpoints_offset = static_info_offset + STATIC_INFO_CAPACITY;

        let slot_meta_offset = endpoint_count
            .checked_mul(size_of::<EndpointEntry>())
            .and_then(|len| len.checked_add(endpoints_offset))
            .ok_or_else(overflow)?;

        let borrow_offset = params
            .slot_count
            .checked_mul(size_of::<SlotMeta>())
            .and_then(|len| len.checked_add(slot_meta_offset))
            .and_then(|end| align_up(end, CACHE_LINE_SIZE))
            .ok_or_else(overflow)?;

        let queues_offset = params
            .max_subscribers
            .checked_mul(params.slot_count)
            .and_then(|n| n.checked_mul(size_of::<u32>()))
            .and_then(|len| len.checked_add(borrow_offset))
            .and_then(|end| align_up(end, CACHE_LINE_SIZE))
            .ok_or_else(overflow)?;

        let queue_stride = if params.queue_capacity == 0 {
            0
        } else {
            params
                .queue_capacity
                .checked_mul(size_of::<QueueCell>())
                .and_then(|len| len.checked_add(size_of::<QueueHeader>()))
                .and_then(|len| align_up(len, CACHE_LINE_SIZE))
                .ok_or_else(overflow)?
        };

        let events_offset = queue_stride
            .checked_mul(params.max_subscribers)
            .and_then(|len| len.checked_add(queues_offset))
            .and_then(|end| align_up(end, CACHE_LINE_SIZE))
            .ok_or_else(overflow)?;

        let event_stride = params
            .event_words()
            .checked_mul(size_of::<u64>())
            .and_then(|len| align_up(len, CACHE_LINE_SIZE))
            .ok_or_else(overflow)?;

        let data_offset = event_stride
            .checked_mul(params.max_subscribers)
            .and_then(|len| len.checked_add(events_offset))
            .and_then(|end| align_up(end, slot_align))
            .ok_or_else(overflow)?;

        let payload_offset = align_up(size_of::<SampleHeader>(), slot_align).ok_or_else(overflow)?;
        let slot_stride = payload_offset
            .checked_add(params.payload_size)
            .and_then(|len| align_up(len, slot_align))
            .ok_or_else(overflow)?;

        let total_size = slot_stride
            .checked_mul(params.slot_count)
            .and_then(|len| len.checked_add(data_offset))
            .ok_or_else(overflow)?;

        Ok(Self {
            params,
            static_info_offset,
            endpoints_offset,
            slot_meta_offset,
            borrow_offset,
            queues_offset,
            queue_stride,
            events_offset,
            event_stride,
            data_offset,
            payload_offset,
            slot_stride,
            total_size,
        })
    }

    /// Recompute the layout recorded in an initialized header
    pub fn from_header(header: &SegmentHeader) -> Result<Self> {
        Self::compute(LayoutParams {
            payload_size: header.payload_size as usize,
            type_align: header.type_align as usize,
            slot_count: header.slot_count as usize,
            max_publishers: header.max_publishers as usize,
            max_subscribers: header.max_subscribers as usize,
            queue_capacity: header.queue_capacity as usize,
            event_capacity: header.event_capacity as usize,
        })
    }

    /// Total number of endpoint table entries
    pub fn endpoint_count(&self) -> usize {
        self.params.max_publishers + self.params.max_subscribers
    }

    /// Offset of slot `index`'s sample header
    pub fn slot_offset(&self, index: usize) -> usize {
        self.data_offset + index * self.slot_stride
    }

    /// Offset of the queue owned by subscriber `sub` (0-based within subscribers)
    pub fn queue_offset(&self, sub: usize) -> usize {
        self.queues_offset + sub * self.queue_stride
    }

    /// Offset of the pending event set of listener `sub` (0-based within
    /// consumers)
    pub fn event_set_offset(&self, sub: usize) -> usize {
        self.events_offset + sub * self.event_stride
    }

    /// Offset of the borrow counters row of subscriber `sub`
    pub fn borrow_row_offset(&self, sub: usize) -> usize {
        self.borrow_offset + sub * self.params.slot_count * size_of::<u32>()
    }
}
