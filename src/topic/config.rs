//! Topic configuration and overflow policies

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    config::{
        DEFAULT_BLOCK_TIMEOUT, DEFAULT_MAX_PUBLISHERS, DEFAULT_MAX_SUBSCRIBERS,
        DEFAULT_PAYLOAD_SIZE, DEFAULT_POOL_CAPACITY, DEFAULT_QUEUE_CAPACITY, MAX_ENDPOINTS,
        MAX_POOL_CAPACITY, MAX_QUEUE_CAPACITY,
    },
    error::{Result, SeuratError},
    layout::MessagingPattern,
    memory::SegmentConfig,
};

use super::{descriptor::TypeDescriptor, name::validate_name};

/// What happens when a subscriber queue or the sample pool is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the oldest queued sample; pool exhaustion fails immediately
    DropOldest,
    /// Suspend the publisher until space frees or the block timeout elapses
    Block,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

impl OverflowPolicy {
    /// Encoding stored in the shared endpoint table
    pub fn as_raw(&self) -> u32 {
        match self {
            OverflowPolicy::DropOldest => 0,
            OverflowPolicy::Block => 1,
        }
    }

    /// Decode from the shared endpoint table
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => OverflowPolicy::Block,
            _ => OverflowPolicy::DropOldest,
        }
    }

    /// Get a human-readable name for the policy
    pub fn name(&self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop-oldest",
            OverflowPolicy::Block => "block",
        }
    }
}

/// Configuration of a topic as seen by one endpoint.
///
/// The layout fields (`type_descriptor`, `payload_size`, `pool_capacity`,
/// `max_publishers`, `max_subscribers`, `queue_capacity`) must match the
/// existing segment exactly, otherwise connecting fails with `Incompatible`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Topic name, unique within its domain
    pub name: String,
    /// Payload type
    pub type_descriptor: TypeDescriptor,
    /// Capacity of one sample slot in bytes
    pub payload_size: usize,
    /// Number of sample slots in the pool
    pub pool_capacity: usize,
    /// Maximum concurrently connected publishers
    pub max_publishers: usize,
    /// Maximum concurrently connected subscribers
    pub max_subscribers: usize,
    /// Per-subscriber queue depth (power of two, at least 2)
    pub queue_capacity: usize,
    /// Overflow behaviour for this endpoint
    pub overflow_policy: OverflowPolicy,
    /// Default timeout for blocking receives (`None` waits forever)
    pub receive_timeout: Option<Duration>,
    /// How long a `Block` policy may suspend a publisher
    pub block_timeout: Duration,
    /// Keep the segment when the last process detaches
    pub persistent: bool,
    /// Stamp and verify a CRC32 of every payload
    pub checksum_payloads: bool,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            type_descriptor: TypeDescriptor::bytes(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_publishers: DEFAULT_MAX_PUBLISHERS,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            receive_timeout: None,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            persistent: false,
            checksum_payloads: false,
        }
    }
}

impl TopicConfig {
    /// Create a byte-payload topic configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create a configuration whose slots hold exactly one `T`
    pub fn for_type<T: bytemuck::Pod>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_descriptor: TypeDescriptor::of::<T>(),
            payload_size: std::mem::size_of::<T>(),
            ..Default::default()
        }
    }

    /// Set the payload type descriptor
    pub fn with_type_descriptor(mut self, descriptor: TypeDescriptor) -> Self {
        self.type_descriptor = descriptor;
        self
    }

    /// Set the slot payload capacity
    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size;
        self
    }

    /// Set the number of slots in the pool
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Set the maximum number of publishers
    pub fn with_max_publishers(mut self, count: usize) -> Self {
        self.max_publishers = count;
        self
    }

    /// Set the maximum number of subscribers
    pub fn with_max_subscribers(mut self, count: usize) -> Self {
        self.max_subscribers = count;
        self
    }

    /// Set the per-subscriber queue depth
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the overflow policy
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set the default receive timeout
    pub fn with_receive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the block timeout
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Keep the segment after the last detach
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Enable payload checksums
    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksum_payloads = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_name("topic", &self.name)?;
        self.type_descriptor.validate()?;

        if self.payload_size == 0 {
            return Err(SeuratError::invalid_parameter(
                "payload_size",
                "Payload size must be greater than 0",
            ));
        }

        if (self.payload_size as u64) < self.type_descriptor.size {
            return Err(SeuratError::invalid_parameter(
                "payload_size",
                format!(
                    "Payload size {} is smaller than the type size {}",
                    self.payload_size, self.type_descriptor.size
                ),
            ));
        }

        if self.payload_size > u32::MAX as usize {
            return Err(SeuratError::invalid_parameter(
                "payload_size",
                "Payload size must fit in 32 bits",
            ));
        }

        if self.pool_capacity == 0 || self.pool_capacity > MAX_POOL_CAPACITY {
            return Err(SeuratError::invalid_parameter(
                "pool_capacity",
                format!("Pool capacity must be between 1 and {}", MAX_POOL_CAPACITY),
            ));
        }

        if self.max_publishers == 0 || self.max_publishers > MAX_ENDPOINTS {
            return Err(SeuratError::invalid_parameter(
                "max_publishers",
                format!("Publisher limit must be between 1 and {}", MAX_ENDPOINTS),
            ));
        }

        if self.max_subscribers == 0 || self.max_subscribers > MAX_ENDPOINTS {
            return Err(SeuratError::invalid_parameter(
                "max_subscribers",
                format!("Subscriber limit must be between 1 and {}", MAX_ENDPOINTS),
            ));
        }

        if self.queue_capacity < 2
            || !self.queue_capacity.is_power_of_two()
            || self.queue_capacity > MAX_QUEUE_CAPACITY
        {
            return Err(SeuratError::invalid_parameter(
                "queue_capacity",
                format!(
                    "Queue capacity must be a power of two between 2 and {}",
                    MAX_QUEUE_CAPACITY
                ),
            ));
        }

        Ok(())
    }

    /// Shared layout implied by this configuration
    pub fn segment_config(&self) -> SegmentConfig {
        SegmentConfig {
            pattern: MessagingPattern::PublishSubscribe,
            type_descriptor: self.type_descriptor.clone(),
            payload_size: self.payload_size,
            slot_count: self.pool_capacity,
            max_publishers: self.max_publishers,
            max_subscribers: self.max_subscribers,
            queue_capacity: self.queue_capacity,
            event_capacity: 0,
            persistent: self.persistent,
            checksum_payloads: self.checksum_payloads,
        }
    }
}
