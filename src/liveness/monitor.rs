//! Background heartbeat refresh and liveness sweeps

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info};

use crate::{
    endpoint::EndpointTable,
    error::{Result, SeuratError},
    memory::SegmentManager,
};

use super::sweep::{sweep_segment, SweepReport};

/// Thread that periodically refreshes the heartbeats of this process's
/// endpoints and sweeps the segments it has mapped.
///
/// Stops when dropped.
#[derive(Debug)]
pub struct LivenessMonitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<SweepReport>>,
    interval: Duration,
}

impl LivenessMonitor {
    /// Start monitoring the segments opened through `segments`
    pub fn spawn(
        segments: Arc<SegmentManager>,
        interval: Duration,
        heartbeat_timeout: Option<Duration>,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(SeuratError::invalid_parameter(
                "monitor_interval",
                "Monitor interval must be greater than 0",
            ));
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("seurat-liveness".to_string())
            .spawn(move || run(&segments, &flag, interval, heartbeat_timeout))
            .map_err(|e| SeuratError::from_io(e, "Failed to spawn liveness monitor"))?;

        info!("Liveness monitor started (interval {:?})", interval);
        Ok(Self {
            running,
            handle: Some(handle),
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and return everything it reclaimed
    pub fn stop(mut self) -> SweepReport {
        self.shutdown()
    }

    fn shutdown(&mut self) -> SweepReport {
        self.running.store(false, Ordering::Release);
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return SweepReport::default(),
        };
        handle.thread().unpark();
        match handle.join() {
            Ok(report) => report,
            Err(_) => {
                error!("Liveness monitor thread panicked");
                SweepReport::default()
            }
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    segments: &SegmentManager,
    running: &AtomicBool,
    interval: Duration,
    heartbeat_timeout: Option<Duration>,
) -> SweepReport {
    let mut total = SweepReport::default();

    while running.load(Ordering::Acquire) {
        let started = Instant::now();

        for segment in segments.live_segments() {
            EndpointTable::new(&segment).refresh_own();
            let report = sweep_segment(&segment, heartbeat_timeout);
            if report.endpoints_reclaimed() > 0 {
                debug!("Sweep of {}: {:?}", segment.name(), report);
            }
            total.merge(&report);
        }

        // park_timeout may wake spuriously; re-check the deadline.
        let deadline = started + interval;
        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }

    debug!(
        "Liveness monitor stopped after reclaiming {} endpoints",
        total.endpoints_reclaimed()
    );
    total
}
