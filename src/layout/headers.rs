//! `repr(C)` structures living inside a segment
//!
//! Every field that more than one process mutates after initialization is an
//! atomic. Plain fields are written once by the creator before the segment
//! state is published as `Ready` and are read-only afterwards.

use std::{
    mem::size_of,
    ptr::addr_of_mut,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use super::constants::*;

/// Lifecycle of a segment as recorded in its header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// File exists but the creator has not started writing the header
    Uninitialized,
    /// Creator is laying out the segment
    Initializing,
    /// Segment is usable
    Ready,
    /// Last detacher is unlinking the segment
    Destroying,
    /// An invariant was violated; the segment must be recreated
    Corrupted,
}

impl SegmentState {
    pub fn as_raw(&self) -> u32 {
        match self {
            SegmentState::Uninitialized => 0,
            SegmentState::Initializing => 1,
            SegmentState::Ready => 2,
            SegmentState::Destroying => 3,
            SegmentState::Corrupted => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => SegmentState::Uninitialized,
            1 => SegmentState::Initializing,
            2 => SegmentState::Ready,
            3 => SegmentState::Destroying,
            _ => SegmentState::Corrupted,
        }
    }
}

/// How endpoints of a segment talk to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessagingPattern {
    /// Publishers send samples from the slot pool to subscriber queues
    PublishSubscribe,
    /// Notifiers raise event ids in listener bitsets; no payload
    Event,
}

impl MessagingPattern {
    pub fn as_raw(&self) -> u32 {
        match self {
            MessagingPattern::PublishSubscribe => 1,
            MessagingPattern::Event => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MessagingPattern::PublishSubscribe),
            2 => Some(MessagingPattern::Event),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessagingPattern::PublishSubscribe => "publish-subscribe",
            MessagingPattern::Event => "event",
        }
    }
}

/// Global header at offset 0 of every segment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: u64,
    /// Layout version
    pub layout_version: u32,
    /// Raw [`SegmentState`]
    pub state: AtomicU32,
    /// Process that created the segment
    pub creator_pid: u32,
    /// `FLAG_*` bits
    pub flags: u32,
    /// Payload type size
    pub type_size: u64,
    /// Payload type alignment
    pub type_align: u32,
    /// Capacity of one slot payload
    pub payload_size: u32,
    /// Payload schema hash
    pub schema_hash: u64,
    /// Number of sample slots
    pub slot_count: u32,
    /// Publisher entries in the endpoint table
    pub max_publishers: u32,
    /// Subscriber entries in the endpoint table
    pub max_subscribers: u32,
    /// Depth of every subscriber queue
    pub queue_capacity: u32,
    /// Raw [`MessagingPattern`]
    pub pattern: u32,
    /// Distinct event ids per listener (event segments only)
    pub event_capacity: u32,
    /// Total segment size in bytes
    pub total_size: u64,
    /// Creation time (nanoseconds since UNIX epoch)
    pub created_at: u64,
    /// Length of the serialized static info block
    pub static_info_len: u32,
    /// CRC32 of the static info block
    pub static_info_crc: u32,
    /// Number of attached segment handles
    pub attached: AtomicU32,
    /// Futex word bumped whenever a slot returns to the free list
    pub slot_signal: AtomicU32,
    /// Tagged free-list head: `(tag << 32) | index`
    pub free_head: AtomicU64,
    /// Source of endpoint identifiers
    pub next_endpoint_id: AtomicU64,
    /// Samples sent by all publishers
    pub samples_sent: AtomicU64,
    /// Samples discarded by `DropOldest` overflow
    pub samples_dropped: AtomicU64,
    /// Slots force-reclaimed by liveness sweeps
    pub slots_reclaimed: AtomicU64,
}

/// Parameters written into a fresh header
#[derive(Debug, Clone)]
pub struct HeaderParams {
    pub pattern: MessagingPattern,
    pub flags: u32,
    pub type_size: u64,
    pub type_align: u32,
    pub payload_size: u32,
    pub schema_hash: u64,
    pub slot_count: u32,
    pub max_publishers: u32,
    pub max_subscribers: u32,
    pub queue_capacity: u32,
    pub event_capacity: u32,
    pub total_size: u64,
    pub created_at: u64,
    pub static_info_len: u32,
    pub static_info_crc: u32,
}

impl SegmentHeader {
    /// Write the plain fields of a header into zeroed memory and mark it
    /// `Initializing`. The caller publishes `Ready` once the rest of the
    /// segment is laid out.
    ///
    /// # Safety
    /// `ptr` must point to zeroed, writable memory of at least
    /// `size_of::<SegmentHeader>()` bytes that only the creator writes to.
    pub unsafe fn initialize(ptr: *mut SegmentHeader, params: &HeaderParams) {
        (*ptr).state.store(SegmentState::Initializing.as_raw(), Ordering::Release);

        addr_of_mut!((*ptr).magic).write(SEGMENT_MAGIC);
        addr_of_mut!((*ptr).layout_version).write(LAYOUT_VERSION);
        addr_of_mut!((*ptr).creator_pid).write(std::process::id());
        addr_of_mut!((*ptr).flags).write(params.flags);
        addr_of_mut!((*ptr).type_size).write(params.type_size);
        addr_of_mut!((*ptr).type_align).write(params.type_align);
        addr_of_mut!((*ptr).payload_size).write(params.payload_size);
        addr_of_mut!((*ptr).schema_hash).write(params.schema_hash);
        addr_of_mut!((*ptr).slot_count).write(params.slot_count);
        addr_of_mut!((*ptr).max_publishers).write(params.max_publishers);
        addr_of_mut!((*ptr).max_subscribers).write(params.max_subscribers);
        addr_of_mut!((*ptr).queue_capacity).write(params.queue_capacity);
        addr_of_mut!((*ptr).pattern).write(params.pattern.as_raw());
        addr_of_mut!((*ptr).event_capacity).write(params.event_capacity);
        addr_of_mut!((*ptr).total_size).write(params.total_size);
        addr_of_mut!((*ptr).created_at).write(params.created_at);
        addr_of_mut!((*ptr).static_info_len).write(params.static_info_len);
        addr_of_mut!((*ptr).static_info_crc).write(params.static_info_crc);

        (*ptr).attached.store(0, Ordering::Relaxed);
        (*ptr).slot_signal.store(0, Ordering::Relaxed);
        (*ptr).next_endpoint_id.store(1, Ordering::Relaxed);
    }

    /// Current lifecycle state
    pub fn state(&self) -> SegmentState {
        SegmentState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn pattern(&self) -> Option<MessagingPattern> {
        MessagingPattern::from_raw(self.pattern)
    }

    /// Check if the persistent flag is set
    pub fn is_persistent(&self) -> bool {
        self.flags & FLAG_PERSISTENT != 0
    }

    /// Check if payload checksums are enabled
    pub fn has_checksums(&self) -> bool {
        self.flags & FLAG_CHECKSUM != 0
    }

    /// Poison the segment; every later open fails with `Corrupted`
    pub fn mark_corrupted(&self) {
        self.state.store(SegmentState::Corrupted.as_raw(), Ordering::SeqCst);
    }
}

/// Lifecycle of an endpoint table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Free,
    Claimed,
    Active,
    Closing,
}

impl EntryState {
    pub fn as_raw(&self) -> u32 {
        match self {
            EntryState::Free => 0,
            EntryState::Claimed => 1,
            EntryState::Active => 2,
            EntryState::Closing => 3,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => EntryState::Claimed,
            2 => EntryState::Active,
            3 => EntryState::Closing,
            _ => EntryState::Free,
        }
    }
}

/// Role of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    Publisher,
    Subscriber,
    Notifier,
    Listener,
}

impl EndpointKind {
    pub fn as_raw(&self) -> u32 {
        match self {
            EndpointKind::Publisher => 1,
            EndpointKind::Subscriber => 2,
            EndpointKind::Notifier => 3,
            EndpointKind::Listener => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(EndpointKind::Publisher),
            2 => Some(EndpointKind::Subscriber),
            3 => Some(EndpointKind::Notifier),
            4 => Some(EndpointKind::Listener),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EndpointKind::Publisher => "publisher",
            EndpointKind::Subscriber => "subscriber",
            EndpointKind::Notifier => "notifier",
            EndpointKind::Listener => "listener",
        }
    }

    /// Publishers and notifiers occupy the producer half of the table
    pub fn is_producer(&self) -> bool {
        matches!(self, EndpointKind::Publisher | EndpointKind::Notifier)
    }
}

/// One endpoint registration
#[repr(C, align(64))]
pub struct EndpointEntry {
    /// Raw [`EntryState`]
    pub state: AtomicU32,
    /// Raw [`EndpointKind`]
    pub kind: AtomicU32,
    /// Owning process
    pub pid: AtomicU32,
    /// Raw overflow policy (subscribers)
    pub policy: AtomicU32,
    /// Segment-unique endpoint identifier
    pub endpoint_id: AtomicU64,
    /// Last heartbeat (nanoseconds since UNIX epoch)
    pub heartbeat: AtomicU64,
    /// Connection time (nanoseconds since UNIX epoch)
    pub connected_at: AtomicU64,
    /// Futex word: bumped when data is queued for this subscriber or an
    /// event is raised for this listener
    pub data_signal: AtomicU32,
    /// Futex word: bumped when this subscriber frees queue space
    pub space_signal: AtomicU32,
    /// Samples or events sent (producers) or received (consumers)
    pub counter: AtomicU64,
    /// Samples dropped on overflow
    pub dropped: AtomicU32,
    /// Consumers reached by the last send or notify
    pub peers: AtomicU32,
}

impl EndpointEntry {
    pub fn state(&self) -> EntryState {
        EntryState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn kind(&self) -> Option<EndpointKind> {
        EndpointKind::from_raw(self.kind.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == EntryState::Active
    }
}

/// States of a sample slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Free,
    Writing,
    InFlight,
}

impl SlotState {
    pub fn as_raw(&self) -> u32 {
        match self {
            SlotState::Free => 0,
            SlotState::Writing => 1,
            SlotState::InFlight => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => SlotState::Writing,
            2 => SlotState::InFlight,
            _ => SlotState::Free,
        }
    }
}

/// Per-slot bookkeeping
#[repr(C)]
pub struct SlotMeta {
    /// Raw [`SlotState`]
    pub state: AtomicU32,
    /// Bumped on every reclaim so stale handles are detected
    pub generation: AtomicU32,
    /// Next index in the free list
    pub next_free: AtomicU32,
    _reserved: u32,
    /// `(writer << 32) | readers`: the publisher entry index + 1 while it
    /// still loans or sends the slot, and the outstanding reader references.
    /// One word so the writer's hold and the readers are dropped atomically
    /// with respect to each other.
    pub refs: AtomicU64,
    /// Loan time (nanoseconds since UNIX epoch)
    pub loaned_at: AtomicU64,
}

/// Mask of the reader count inside [`SlotMeta::refs`]
pub const REFS_READERS_MASK: u64 = 0xffff_ffff;

/// `refs` word holding only a writer mark
pub fn refs_writer(mark: u32) -> u64 {
    (mark as u64) << 32
}

/// Writer mark of a `refs` word; 0 when no publisher holds the slot
pub fn refs_writer_of(refs: u64) -> u32 {
    (refs >> 32) as u32
}

/// Reader count of a `refs` word
pub fn refs_readers_of(refs: u64) -> u32 {
    (refs & REFS_READERS_MASK) as u32
}

impl SlotMeta {
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn readers(&self) -> u32 {
        refs_readers_of(self.refs.load(Ordering::Acquire))
    }

    pub fn writer(&self) -> u32 {
        refs_writer_of(self.refs.load(Ordering::Acquire))
    }
}

/// Producer and consumer cursors of a subscriber queue
#[repr(C, align(64))]
#[derive(Debug)]
pub struct QueueHeader {
    pub enqueue_pos: AtomicU64,
    _pad0: [u8; CACHE_LINE_SIZE - 8],
    pub dequeue_pos: AtomicU64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
}

/// One queue cell holding a packed slot reference
#[repr(C)]
#[derive(Debug)]
pub struct QueueCell {
    pub sequence: AtomicU64,
    pub value: AtomicU64,
}

/// Header written in front of every payload
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleHeader {
    /// Endpoint id of the sending publisher
    pub publisher_id: u64,
    /// Per-publisher sequence number, starting at 1
    pub sequence: u64,
    /// Send time (nanoseconds since UNIX epoch)
    pub timestamp: u64,
    /// Valid payload bytes
    pub len: u32,
    /// CRC32 of the payload when checksums are enabled
    pub checksum: u32,
}

const _: () = assert!(size_of::<EndpointEntry>() == 64);
const _: () = assert!(size_of::<SlotMeta>() == 32);
const _: () = assert!(size_of::<QueueHeader>() == 2 * CACHE_LINE_SIZE);
const _: () = assert!(size_of::<QueueCell>() == 16);
const _: () = assert!(size_of::<SampleHeader>() == 32);
const _: () = assert!(size_of::<SegmentHeader>() % CACHE_LINE_SIZE == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_encodings() {
        for state in [
            SegmentState::Uninitialized,
            SegmentState::Initializing,
            SegmentState::Ready,
            SegmentState::Destroying,
            SegmentState::Corrupted,
        ] {
            assert_eq!(SegmentState::from_raw(state.as_raw()), state);
        }

        for state in [SlotState::Free, SlotState::Writing, SlotState::InFlight] {
            assert_eq!(SlotState::from_raw(state.as_raw()), state);
        }

        assert_eq!(EndpointKind::from_raw(0), None);
        for kind in [
            EndpointKind::Publisher,
            EndpointKind::Subscriber,
            EndpointKind::Notifier,
            EndpointKind::Listener,
        ] {
            assert_eq!(EndpointKind::from_raw(kind.as_raw()), Some(kind));
        }
        assert!(EndpointKind::Notifier.is_producer());
        assert!(!EndpointKind::Listener.is_producer());
        assert_eq!(MessagingPattern::from_raw(0), None);
    }

    #[test]
    fn test_refs_word_halves() {
        let refs = refs_writer(3) | 2;
        assert_eq!(refs_writer_of(refs), 3);
        assert_eq!(refs_readers_of(refs), 2);
        assert_eq!(refs & REFS_READERS_MASK, 2);
    }

    #[test]
    fn test_header_initialization() {
        let mut storage = vec![0u8; size_of::<SegmentHeader>() + CACHE_LINE_SIZE];
        let offset = storage.as_ptr().align_offset(CACHE_LINE_SIZE);
        let ptr = unsafe { storage.as_mut_ptr().add(offset) } as *mut SegmentHeader;

        let params = HeaderParams {
            pattern: MessagingPattern::PublishSubscribe,
            flags: FLAG_PERSISTENT,
            type_size: 8,
            type_align: 8,
            payload_size: 64,
            schema_hash: 42,
            slot_count: 4,
            max_publishers: 1,
            max_subscribers: 2,
            queue_capacity: 8,
            event_capacity: 0,
            total_size: 4096,
            created_at: 1,
            static_info_len: 0,
            static_info_crc: 0,
        };

        unsafe { SegmentHeader::initialize(ptr, &params) };
        let header = unsafe { &*ptr };

        assert_eq!(header.magic, SEGMENT_MAGIC);
        assert_eq!(header.layout_version, LAYOUT_VERSION);
        assert_eq!(header.state(), SegmentState::Initializing);
        assert!(header.is_persistent());
        assert!(!header.has_checksums());
        assert_eq!(header.pattern(), Some(MessagingPattern::PublishSubscribe));
        assert_eq!(header.next_endpoint_id.load(Ordering::Relaxed), 1);
    }
}
