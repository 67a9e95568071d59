//! Publishers, subscribers and the shared endpoint table

pub mod publisher;
pub mod sample;
pub mod subscriber;
pub mod table;

pub use publisher::Publisher;
pub use sample::{Sample, SampleMut};
pub use subscriber::{CancelHandle, Subscriber};
pub use table::EndpointTable;
