//! Read-only discovery of domains, topics and endpoints

pub mod records;
pub mod service;

pub use records::{DomainInfo, EndpointInfo, TopicInfo};
pub use service::Discovery;
