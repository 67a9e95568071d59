//! Domains: configuration and the handle endpoints connect through

pub mod config;
#[allow(clippy::module_inception)]
pub mod domain;

pub use config::DomainConfig;
pub use domain::Domain;
