//! Topic identity: names, payload type descriptors and per-endpoint settings

pub mod config;
pub mod descriptor;
pub mod name;

pub use config::{OverflowPolicy, TopicConfig};
pub use descriptor::TypeDescriptor;
pub use name::validate_name;
