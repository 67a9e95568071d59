//! Event service configuration

use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    config::{
        DEFAULT_EVENT_ID_MAX, DEFAULT_MAX_LISTENERS, DEFAULT_MAX_NOTIFIERS, MAX_ENDPOINTS,
        MAX_EVENT_ID,
    },
    error::{Result, SeuratError},
    layout::MessagingPattern,
    memory::SegmentConfig,
    topic::{validate_name, TypeDescriptor},
};

/// Identifier carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EventId(usize);

impl EventId {
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> usize {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration of an event service as seen by one endpoint.
///
/// An existing service must offer at least `max_notifiers`, `max_listeners`
/// and `event_id_max`; smaller requests open a larger service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Service name, unique within its domain and shared with topics
    pub name: String,
    /// Maximum concurrently connected notifiers
    pub max_notifiers: usize,
    /// Maximum concurrently connected listeners
    pub max_listeners: usize,
    /// Largest event id a notifier may send
    pub event_id_max: usize,
    /// Id sent by [`Notifier::notify`](super::Notifier::notify)
    pub default_event_id: EventId,
    /// Keep the segment when the last process detaches
    pub persistent: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_notifiers: DEFAULT_MAX_NOTIFIERS,
            max_listeners: DEFAULT_MAX_LISTENERS,
            event_id_max: DEFAULT_EVENT_ID_MAX,
            default_event_id: EventId::default(),
            persistent: false,
        }
    }
}

impl EventConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_notifiers(mut self, count: usize) -> Self {
        self.max_notifiers = count;
        self
    }

    pub fn with_max_listeners(mut self, count: usize) -> Self {
        self.max_listeners = count;
        self
    }

    pub fn with_event_id_max(mut self, value: usize) -> Self {
        self.event_id_max = value;
        self
    }

    pub fn with_default_event_id(mut self, id: EventId) -> Self {
        self.default_event_id = id;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// A zero endpoint limit is raised to one
    pub(crate) fn adjusted(mut self) -> Self {
        if self.max_notifiers == 0 {
            warn!("Event service {}: max_notifiers 0 raised to 1", self.name);
            self.max_notifiers = 1;
        }
        if self.max_listeners == 0 {
            warn!("Event service {}: max_listeners 0 raised to 1", self.name);
            self.max_listeners = 1;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_name("event service", &self.name)?;

        if self.max_notifiers > MAX_ENDPOINTS {
            return Err(SeuratError::invalid_parameter(
                "max_notifiers",
                format!("Notifier limit must be at most {}", MAX_ENDPOINTS),
            ));
        }

        if self.max_listeners > MAX_ENDPOINTS {
            return Err(SeuratError::invalid_parameter(
                "max_listeners",
                format!("Listener limit must be at most {}", MAX_ENDPOINTS),
            ));
        }

        if self.event_id_max > MAX_EVENT_ID {
            return Err(SeuratError::invalid_parameter(
                "event_id_max",
                format!("Largest event id must be at most {}", MAX_EVENT_ID),
            ));
        }

        if self.default_event_id.as_value() > self.event_id_max {
            return Err(SeuratError::invalid_parameter(
                "default_event_id",
                format!(
                    "Default event id {} exceeds the largest event id {}",
                    self.default_event_id, self.event_id_max
                ),
            ));
        }

        Ok(())
    }

    /// Shared layout implied by this configuration
    pub fn segment_config(&self) -> SegmentConfig {
        SegmentConfig {
            pattern: MessagingPattern::Event,
            type_descriptor: TypeDescriptor::custom("seurat::event", 1, 1),
            payload_size: 0,
            slot_count: 0,
            max_publishers: self.max_notifiers.max(1),
            max_subscribers: self.max_listeners.max(1),
            queue_capacity: 0,
            event_capacity: self.event_id_max + 1,
            persistent: self.persistent,
            checksum_payloads: false,
        }
    }
}
