//! Reference-counted sample slots shared between processes

pub mod pool;
pub mod slot;
pub mod stats;

pub use pool::SamplePool;
pub use slot::SlotRef;
pub use stats::PoolStats;
