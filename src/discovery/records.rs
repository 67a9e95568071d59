//! Snapshots returned by discovery

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    layout::{EndpointKind, MessagingPattern},
    pool::PoolStats,
    topic::{OverflowPolicy, TypeDescriptor},
};

/// A domain directory below the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub path: PathBuf,
    /// Readable topics at the time of the listing
    pub topic_count: usize,
}

/// One ready topic segment, publish-subscribe or event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub pattern: MessagingPattern,
    pub domain: String,
    pub name: String,
    pub path: PathBuf,
    pub type_descriptor: TypeDescriptor,
    pub payload_size: usize,
    pub pool_capacity: usize,
    pub queue_capacity: usize,
    pub max_publishers: usize,
    pub max_subscribers: usize,
    /// Distinct event ids of an event service; 0 otherwise
    pub event_capacity: usize,
    pub persistent: bool,
    pub checksums: bool,
    /// Segment size in bytes
    pub size: usize,
    /// Attached handles, including ones not backing an endpoint
    pub attached: u32,
    /// Live publishers or notifiers
    pub producers: usize,
    /// Live subscribers or listeners
    pub consumers: usize,
    pub created_by: u32,
    pub created_at_nanos: u64,
    pub pool: PoolStats,
}

/// One live endpoint of a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub id: u64,
    pub kind: EndpointKind,
    pub pid: u32,
    /// Overflow policy; meaningful for subscribers only
    pub policy: OverflowPolicy,
    pub connected_at_nanos: u64,
    pub heartbeat_nanos: u64,
    /// Samples sent or received, or notifications sent or consumed
    pub samples: u64,
    /// Samples a subscriber lost to `DropOldest` overflow
    pub dropped: u32,
    /// Consumers reached by a producer's last send or notify
    pub peers: u32,
}
