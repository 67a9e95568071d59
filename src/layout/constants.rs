//! Constants for the shared segment layout

/// Cache line size for alignment (64 bytes on most x86_64 systems)
pub const CACHE_LINE_SIZE: usize = 64;

/// Magic number identifying a segment file
pub const SEGMENT_MAGIC: u64 = 0x5345_5552_4154_5347; // "SEURATSG"

/// Current layout version; any other value is rejected as incompatible
pub const LAYOUT_VERSION: u32 = 2;

/// Bytes reserved for the serialized static topic information
pub const STATIC_INFO_CAPACITY: usize = 1024;

/// Sentinel terminating the slot free list
pub const FREE_LIST_END: u32 = u32::MAX;

/// File extension of segment files
pub const SEGMENT_EXTENSION: &str = "seg";

/// Header flag: keep the segment after the last detach
pub const FLAG_PERSISTENT: u32 = 1 << 0;

/// Header flag: payloads carry a CRC32
pub const FLAG_CHECKSUM: u32 = 1 << 1;

/// Event ids tracked by one word of a listener's pending set
pub const EVENT_WORD_BITS: usize = 64;
