//! Per-subscriber delivery queues

pub mod ring;

pub use ring::SharedQueue;
