//! Process liveness, crash recovery sweeps and the background monitor

pub mod monitor;
pub mod process;
pub mod sweep;

pub use monitor::LivenessMonitor;
pub use process::{age_of, current_pid, endpoint_alive, now_nanos, process_alive};
pub use sweep::{sweep_segment, SweepReport};
