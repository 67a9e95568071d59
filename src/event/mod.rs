//! Event services: notifiers wake listeners with an event id, no payload
//!
//! An event service is a segment with the `Event` messaging pattern. It has
//! no sample pool and no queues; every listener owns a bit set with one bit
//! per event id, and a notifier sets the bit and signals the listener's
//! futex word. Notifying the same id twice before the listener looks only
//! sets the bit once.

pub mod config;
pub mod listener;
pub mod notifier;

pub use config::{EventConfig, EventId};
pub use listener::Listener;
pub use notifier::Notifier;
