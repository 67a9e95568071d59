//! # Seurat - Zero-Copy Shared Memory Publish/Subscribe
//!
//! Seurat moves samples between processes on one host without copying them.
//! A publisher loans a slot from a pool living in a shared segment, writes the
//! payload in place and sends it; every subscriber receives a reference to the
//! same slot, which returns to the pool once the last reader drops it.
//!
//! ## Features
//!
//! - **Named segments**: one memory-mapped file per topic, `<root>/<domain>/<topic>.seg`
//! - **Lock-free pool**: CAS free list with reference-counted slots
//! - **Bounded subscriber queues**: `DropOldest` or `Block` overflow
//! - **Crash recovery**: liveness sweep reclaims what dead processes held
//! - **Events**: payload-free notifications by event id, over the same segments
//! - **WaitSet**: one thread waiting on many subscribers, listeners and timers
//! - **Discovery**: read-only listing of domains, topics and endpoints
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ loan/send ┌─────────────────────────────────────┐ receive ┌────────────┐
//! │ Publisher │ ────────▶ │ Segment                             │ ──────▶ │ Subscriber │
//! └───────────┘           │ header | endpoints | pool | queues  │         └────────────┘
//!                         └─────────────────────────────────────┘
//!                                          ▲
//!                                          │ read-only
//!                                    ┌───────────┐
//!                                    │ Discovery │
//!                                    └───────────┘
//! ```

pub mod error;
pub mod layout;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod sync;
pub mod topic;

pub mod endpoint;
pub mod event;
pub mod liveness;

pub mod discovery;
pub mod domain;

// Main API re-exports
pub use discovery::{Discovery, DomainInfo, EndpointInfo, TopicInfo};
pub use domain::{Domain, DomainConfig};
pub use endpoint::{CancelHandle, Publisher, Sample, SampleMut, Subscriber};
pub use error::{ErrorKind, Result, SeuratError};
pub use event::{EventConfig, EventId, Listener, Notifier};
pub use layout::{EndpointKind, MessagingPattern, SegmentState, SlotState};
pub use liveness::{LivenessMonitor, SweepReport};
pub use memory::{SegmentConfig, SegmentHandle, SegmentManager};
pub use pool::{PoolStats, SlotRef};
pub use sync::{Attachable, AttachmentId, CallbackProgression, WaitEvent, WaitSet, WaitSetGuard};
pub use topic::{OverflowPolicy, TopicConfig, TypeDescriptor};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Environment variable overriding the segment root directory
    pub const ROOT_ENV: &str = "SEURAT_ROOT";

    /// Directory name under the platform shared memory mount
    pub const ROOT_DIR_NAME: &str = "seurat";

    /// Default number of sample slots per topic
    pub const DEFAULT_POOL_CAPACITY: usize = 64;

    /// Default slot payload capacity (4KB)
    pub const DEFAULT_PAYLOAD_SIZE: usize = 4096;

    /// Default publisher limit per topic
    pub const DEFAULT_MAX_PUBLISHERS: usize = 8;

    /// Default subscriber limit per topic
    pub const DEFAULT_MAX_SUBSCRIBERS: usize = 8;

    /// Default subscriber queue depth
    pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

    /// Default time a `Block` publisher waits for space
    pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(100);

    /// Default time an opener waits for a concurrent creator
    pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_millis(500);

    /// Default interval of the background liveness monitor
    pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(250);

    /// Longest single futex wait before re-checking liveness and cancellation
    pub const WAIT_SLICE: Duration = Duration::from_millis(10);

    /// Maximum length of a domain or topic name
    pub const MAX_NAME_LEN: usize = 200;

    /// Maximum number of slots in one pool
    pub const MAX_POOL_CAPACITY: usize = 1 << 20;

    /// Maximum publishers or subscribers per topic
    pub const MAX_ENDPOINTS: usize = 256;

    /// Maximum subscriber queue depth
    pub const MAX_QUEUE_CAPACITY: usize = 1 << 16;

    /// Default notifier limit per event service
    pub const DEFAULT_MAX_NOTIFIERS: usize = 8;

    /// Default listener limit per event service
    pub const DEFAULT_MAX_LISTENERS: usize = 8;

    /// Default largest event id
    pub const DEFAULT_EVENT_ID_MAX: usize = 63;

    /// Largest event id any service may use
    pub const MAX_EVENT_ID: usize = 4095;
}
