//! Topic segments: files, mappings and their attachment lifecycle

pub mod config;
pub mod manager;
pub mod region;
pub mod segment;

pub use config::{default_root, domain_dir, segment_path, topic_from_path, SegmentConfig};
pub use manager::SegmentManager;
pub use region::{ReadOnlyRegion, SharedMemoryRegion};
pub use segment::{Segment, SegmentHandle};
