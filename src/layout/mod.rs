//! Binary layout of a topic or event segment

pub mod constants;
pub mod headers;
pub mod offsets;
pub mod static_info;

pub use constants::*;
pub use headers::{
    refs_readers_of, refs_writer, refs_writer_of, EndpointEntry, EndpointKind, EntryState,
    HeaderParams, MessagingPattern, QueueCell, QueueHeader, SampleHeader, SegmentHeader,
    SegmentState, SlotMeta, SlotState, REFS_READERS_MASK,
};
pub use offsets::{LayoutParams, SegmentLayout};
pub use static_info::StaticInfo;
