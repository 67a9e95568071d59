//! Crash recovery tests
//! Real child processes are killed while holding slots; sweeps must reclaim them

use std::{
    path::{Path, PathBuf},
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use seurat::{Domain, DomainConfig, EndpointKind, ErrorKind, OverflowPolicy, TopicConfig};
use tempfile::TempDir;

const CHILD_ROOT_ENV: &str = "SEURAT_TEST_CHILD_ROOT";
const CHILD_ROLE_ENV: &str = "SEURAT_TEST_CHILD_ROLE";

fn topic() -> TopicConfig {
    TopicConfig::new("telemetry")
        .with_payload_size(64)
        .with_pool_capacity(4)
        .with_queue_capacity(4)
        .with_max_publishers(2)
        .with_max_subscribers(2)
}

/// Topic whose second queued sample fills the subscriber queue
fn stalled_topic() -> TopicConfig {
    TopicConfig::new("stalled")
        .with_payload_size(64)
        .with_pool_capacity(8)
        .with_queue_capacity(2)
        .with_max_publishers(1)
        .with_max_subscribers(1)
        .with_block_timeout(Duration::from_secs(60))
}

fn domain(root: &Path) -> Domain {
    let _ = env_logger::builder().is_test(true).try_init();
    Domain::open(DomainConfig::new("crash").with_root_dir(root)).unwrap()
}

fn marker(root: &Path) -> PathBuf {
    root.join("child.ready")
}

/// Re-run this test binary as `role`, executing only the child entry point
fn spawn_child(root: &Path, role: &str) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args(["child_entry_point", "--exact", "--ignored", "--nocapture"])
        .env(CHILD_ROOT_ENV, root)
        .env(CHILD_ROLE_ENV, role)
        .spawn()
        .unwrap()
}

fn wait_for_marker(root: &Path, child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !marker(root).exists() {
        if let Some(status) = child.try_wait().unwrap() {
            panic!("child exited early with {}", status);
        }
        assert!(Instant::now() < deadline, "child never became ready");
        thread::sleep(Duration::from_millis(5));
    }
}

fn kill(mut child: Child) {
    child.kill().unwrap();
    child.wait().unwrap();
}

/// Body of the child processes; a no-op in a normal test run
#[test]
#[ignore]
fn child_entry_point() {
    let root = match std::env::var_os(CHILD_ROOT_ENV) {
        Some(root) => PathBuf::from(root),
        None => return,
    };
    let role = std::env::var(CHILD_ROLE_ENV).unwrap_or_default();
    let domain = domain(&root);

    match role.as_str() {
        "writer" => {
            let publisher = domain.publisher(topic()).unwrap();
            let mut sample = publisher.loan().unwrap();
            sample.payload_mut()[..8].copy_from_slice(b"PARTIAL!");
            std::fs::write(marker(&root), b"ready").unwrap();
            // Killed mid-write.
            thread::sleep(Duration::from_secs(60));
            drop(sample);
        }
        "reader" => {
            let subscriber = domain.subscriber(topic()).unwrap();
            std::fs::write(marker(&root), b"ready").unwrap();
            let held = subscriber.receive_timeout(Some(Duration::from_secs(20))).unwrap();
            let queued_too = subscriber.pending();
            std::fs::write(root.join("child.holding"), queued_too.to_string()).unwrap();
            thread::sleep(Duration::from_secs(60));
            drop(held);
        }
        "sender" => {
            let publisher = domain.publisher(stalled_topic()).unwrap();
            std::fs::write(marker(&root), b"ready").unwrap();
            // The third send stalls on the full queue until the kill.
            for i in 0..3u64 {
                publisher.send_pod(&i).unwrap();
            }
            thread::sleep(Duration::from_secs(60));
        }
        other => panic!("unknown child role {:?}", other),
    }
}

#[cfg(test)]
mod reliability_tests {
    use super::*;

    /// Test: a publisher killed mid-write loses its slot to the sweep and
    /// nobody sees the partial sample
    #[test]
    fn killed_writer_slot_reclaimed() {
        let dir = TempDir::new().unwrap();
        let domain = domain(dir.path());
        let subscriber = domain.subscriber(topic()).unwrap();

        let mut child = spawn_child(dir.path(), "writer");
        wait_for_marker(dir.path(), &mut child);

        let before = &domain.topics().unwrap()[0];
        assert_eq!(before.pool.writing, 1);
        assert_eq!(before.producers, 1);

        kill(child);

        assert!(subscriber.try_receive().unwrap().is_none());
        let report = domain.sweep().unwrap();
        assert_eq!(report.publishers_reclaimed, 1);
        assert_eq!(report.slots_reclaimed, 1);

        let after = &domain.topics().unwrap()[0];
        assert_eq!(after.pool.free, 4);
        assert_eq!(after.producers, 0);
        assert_eq!(after.attached, 1);
        assert!(subscriber.try_receive().unwrap().is_none());

        // The pool is fully usable again.
        let publisher = domain.publisher(topic()).unwrap();
        for i in 0..4u64 {
            publisher.send_pod(&i).unwrap();
        }
        for i in 0..4u64 {
            let sample = subscriber.try_receive().unwrap().unwrap();
            assert_eq!(sample.read_pod::<u64>().unwrap(), i);
        }
    }

    /// Test: a subscriber killed while holding and queueing samples gives
    /// every reference back
    #[test]
    fn killed_reader_references_released() {
        let dir = TempDir::new().unwrap();
        let domain = domain(dir.path());
        let publisher = domain.publisher(topic()).unwrap();

        let mut child = spawn_child(dir.path(), "reader");
        wait_for_marker(dir.path(), &mut child);

        let deadline = Instant::now() + Duration::from_secs(20);
        while publisher.subscriber_count() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        for i in 0..3u64 {
            assert_eq!(publisher.send_pod(&i).unwrap(), 1);
        }

        let holding = dir.path().join("child.holding");
        while !holding.exists() {
            assert!(Instant::now() < deadline, "child never received");
            thread::sleep(Duration::from_millis(5));
        }
        kill(child);

        assert!(publisher.loan().is_ok());
        let report = domain.sweep().unwrap();
        assert_eq!(report.subscribers_reclaimed, 1);
        assert_eq!(report.references_released, 3);
        assert_eq!(report.slots_reclaimed, 3);

        let after = &domain.topics().unwrap()[0];
        assert_eq!(after.pool.free, 4);
        assert_eq!(after.consumers, 0);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    /// Test: a publisher killed in the middle of a send gives back the slot
    /// it was still fanning out, while delivered samples stay readable
    #[test]
    fn killed_sender_mid_fan_out_reclaimed() {
        let dir = TempDir::new().unwrap();
        let domain = domain(dir.path());
        let subscriber = domain
            .subscriber(stalled_topic().with_overflow_policy(OverflowPolicy::Block))
            .unwrap();

        let mut child = spawn_child(dir.path(), "sender");
        wait_for_marker(dir.path(), &mut child);

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if domain.topics().unwrap()[0].pool.in_flight == 3 {
                break;
            }
            assert!(Instant::now() < deadline, "sender never stalled");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(subscriber.pending(), 2);
        kill(child);

        let report = domain.sweep().unwrap();
        assert_eq!(report.publishers_reclaimed, 1);
        assert_eq!(report.slots_reclaimed, 1);
        assert_eq!(domain.topics().unwrap()[0].pool.in_flight, 2);

        for i in 0..2u64 {
            let sample = subscriber.try_receive().unwrap().unwrap();
            assert_eq!(sample.read_pod::<u64>().unwrap(), i);
        }
        assert!(subscriber.try_receive().unwrap().is_none());

        let after = &domain.topics().unwrap()[0];
        assert_eq!(after.pool.free, 8);
        assert_eq!(after.producers, 0);
    }

    /// Test: discovery hides endpoints of dead processes even before a sweep
    #[test]
    fn discovery_skips_dead_endpoints() {
        let dir = TempDir::new().unwrap();
        let domain = domain(dir.path());
        let _subscriber = domain.subscriber(topic()).unwrap();

        let mut child = spawn_child(dir.path(), "writer");
        wait_for_marker(dir.path(), &mut child);

        let endpoints = domain.discovery().list_endpoints("crash", "telemetry").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().any(|e| e.kind == EndpointKind::Publisher));

        kill(child);

        let endpoints = domain.discovery().list_endpoints("crash", "telemetry").unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].kind, EndpointKind::Subscriber);
        assert_eq!(endpoints[0].pid, std::process::id());
    }

    /// Test: the background monitor reclaims a dead writer without an
    /// explicit sweep
    #[test]
    fn monitor_reclaims_in_background() {
        let dir = TempDir::new().unwrap();
        let config = DomainConfig::new("crash")
            .with_root_dir(dir.path())
            .with_monitor_interval(Duration::from_millis(20));
        let domain = Domain::open(config).unwrap();
        let publisher = domain.publisher(topic()).unwrap();
        let monitor = domain.spawn_liveness_monitor().unwrap();

        let mut child = spawn_child(dir.path(), "writer");
        wait_for_marker(dir.path(), &mut child);
        kill(child);

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let topics = domain.topics().unwrap();
            if topics[0].pool.free == 4 && topics[0].attached == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "monitor never reclaimed the slot");
            thread::sleep(Duration::from_millis(10));
        }

        let report = monitor.stop();
        assert_eq!(report.publishers_reclaimed, 1);
        assert!(publisher.loan().is_ok());
    }

    /// Test: double release is rejected, never double-freed
    #[test]
    fn double_release_is_corruption() {
        let dir = TempDir::new().unwrap();
        let domain = domain(dir.path());
        let subscriber = domain.subscriber(topic()).unwrap();
        let publisher = domain.publisher(topic()).unwrap();

        publisher.send_copy(b"once").unwrap();
        let sample = subscriber.try_receive().unwrap().unwrap();
        let slot = sample.slot();
        subscriber.release(sample).unwrap();

        let handle = domain.segments().open_existing("crash", "telemetry").unwrap();
        let err = handle.pool().release(slot).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
        assert_eq!(handle.pool().stats().free, 4);
    }
}
