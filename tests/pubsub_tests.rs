//! Publish/subscribe integration tests
//! Ordering, zero-copy round trips, pool exhaustion and overflow policies

use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

use bytemuck::{Pod, Zeroable};
use seurat::{
    Domain, DomainConfig, ErrorKind, OverflowPolicy, TopicConfig, TypeDescriptor,
};
use tempfile::TempDir;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Imu {
    seq: u64,
    accel: [f32; 3],
    gyro: [f32; 3],
}

fn domain(dir: &TempDir) -> Domain {
    Domain::open(DomainConfig::new("robot").with_root_dir(dir.path())).unwrap()
}

fn topic(name: &str) -> TopicConfig {
    TopicConfig::new(name)
        .with_payload_size(256)
        .with_pool_capacity(16)
        .with_queue_capacity(8)
        .with_max_publishers(4)
        .with_max_subscribers(4)
}

#[cfg(test)]
mod pubsub_tests {
    use super::*;

    /// Test: a single publisher's samples arrive in publish order
    #[test]
    fn single_publisher_order() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let subscriber = domain.subscriber(topic("order")).unwrap();
        let publisher = domain.publisher(topic("order")).unwrap();

        let mut expected = 0u64;
        for round in 0..10 {
            for i in 0..5u64 {
                let value = round * 5 + i;
                assert_eq!(publisher.send_pod(&value).unwrap(), 1);
            }
            while let Some(sample) = subscriber.try_receive().unwrap() {
                assert_eq!(sample.read_pod::<u64>().unwrap(), expected);
                assert_eq!(sample.publisher_id(), publisher.id());
                assert_eq!(sample.sequence(), expected + 1);
                expected += 1;
            }
        }
        assert_eq!(expected, 50);
    }

    /// Test: bytes written in place are read back identically
    #[test]
    fn zero_copy_round_trip() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let subscriber = domain.subscriber(topic("bytes")).unwrap();
        let publisher = domain.publisher(topic("bytes")).unwrap();

        let payload: Vec<u8> = (0..200u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut sample = publisher.loan().unwrap();
        assert_eq!(sample.capacity(), 256);
        sample.payload_mut()[..payload.len()].copy_from_slice(&payload);
        sample.set_len(payload.len()).unwrap();
        let slot = sample.slot();
        sample.send().unwrap();

        let received = subscriber.try_receive().unwrap().unwrap();
        assert_eq!(received.slot(), slot);
        assert_eq!(&received[..], &payload[..]);
        subscriber.release(received).unwrap();
    }

    /// Test: typed payloads through `for_type`
    #[test]
    fn typed_topic_round_trip() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let config = TopicConfig::for_type::<Imu>("imu").with_pool_capacity(4);
        let subscriber = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();

        let mut sample = publisher.loan().unwrap();
        *sample.as_pod_mut::<Imu>().unwrap() = Imu {
            seq: 9,
            accel: [0.0, 0.0, 9.81],
            gyro: [0.1, 0.2, 0.3],
        };
        sample.send().unwrap();

        let received = subscriber.receive_timeout(Some(Duration::from_secs(1))).unwrap();
        let imu = received.as_pod::<Imu>().unwrap();
        assert_eq!(imu.seq, 9);
        assert_eq!(imu.accel[2], 9.81);
    }

    /// Test: pool of 4 slots, 4 unsent loans, 5th fails; a send and release
    /// frees a slot for the next loan
    #[test]
    fn capacity_four_scenario() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("cap4").with_pool_capacity(4);

        let subscriber = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();

        let mut loans: Vec<_> = (0..4).map(|_| publisher.loan().unwrap()).collect();
        let slots: Vec<_> = loans.iter().map(|s| s.slot().index).collect();
        let mut unique = slots.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 4);

        let err = publisher.loan().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSpace);

        let mut first = loans.remove(0);
        first.write(b"one").unwrap();
        first.send().unwrap();

        // Still referenced by the subscriber queue.
        assert_eq!(publisher.loan().unwrap_err().kind(), ErrorKind::NoSpace);

        let sample = subscriber.try_receive().unwrap().unwrap();
        assert_eq!(&sample[..], b"one");
        subscriber.release(sample).unwrap();

        let next = publisher.loan().unwrap();
        assert_eq!(next.slot().index, slots[0]);
    }

    /// Test: exhaustion never hands out a slot that is in flight
    #[test]
    fn exhaustion_never_reuses_live_slots() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("live").with_pool_capacity(4);

        let subscriber = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();

        for i in 0..4u64 {
            publisher.send_pod(&i).unwrap();
        }
        assert_eq!(publisher.loan().unwrap_err().kind(), ErrorKind::NoSpace);

        let held: Vec<_> = (0..4)
            .map(|_| subscriber.try_receive().unwrap().unwrap())
            .collect();
        for (i, sample) in held.iter().enumerate() {
            assert_eq!(sample.read_pod::<u64>().unwrap(), i as u64);
        }
        assert_eq!(publisher.loan().unwrap_err().kind(), ErrorKind::NoSpace);

        drop(held);
        assert!(publisher.loan().is_ok());
    }

    /// Test: dropping an unsent loan returns the slot
    #[test]
    fn unsent_loan_returns_slot() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("unsent").with_pool_capacity(1);
        let publisher = domain.publisher(config).unwrap();

        {
            let mut sample = publisher.loan().unwrap();
            sample.write(b"never sent").unwrap();
        }
        let sample = publisher.loan().unwrap();
        assert!(sample.is_empty());
    }

    /// Test: sending with nobody subscribed frees the slot immediately
    #[test]
    fn send_without_subscribers() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let publisher = domain.publisher(topic("lonely").with_pool_capacity(1)).unwrap();

        for _ in 0..3 {
            assert_eq!(publisher.send_copy(b"x").unwrap(), 0);
        }
    }

    /// Test: every subscriber sees every sample; the slot lives until the
    /// last one releases it
    #[test]
    fn fan_out_to_all_subscribers() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("fanout").with_pool_capacity(1);

        let subscribers: Vec<_> = (0..3).map(|_| domain.subscriber(config.clone()).unwrap()).collect();
        let publisher = domain.publisher(config).unwrap();
        assert_eq!(publisher.subscriber_count(), 3);

        assert_eq!(publisher.send_copy(b"hello").unwrap(), 3);

        let mut samples: Vec<_> = subscribers
            .iter()
            .map(|s| s.try_receive().unwrap().unwrap())
            .collect();
        for sample in &samples {
            assert_eq!(&sample[..], b"hello");
        }

        while let Some(sample) = samples.pop() {
            assert_eq!(publisher.loan().unwrap_err().kind(), ErrorKind::NoSpace);
            drop(sample);
        }
        assert!(publisher.loan().is_ok());
    }

    /// Test: `DropOldest` keeps the newest samples and counts the drops
    #[test]
    fn drop_oldest_overflow() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("lossy").with_queue_capacity(4).with_pool_capacity(8);

        let subscriber = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();

        for i in 0..10u64 {
            assert_eq!(publisher.send_pod(&i).unwrap(), 1);
        }

        let received: Vec<u64> = std::iter::from_fn(|| subscriber.try_receive().unwrap())
            .map(|s| s.read_pod::<u64>().unwrap())
            .collect();
        assert_eq!(received, vec![6, 7, 8, 9]);

        let topics = domain.topics().unwrap();
        assert_eq!(topics[0].pool.samples_dropped, 6);
        assert_eq!(topics[0].pool.free, 8);
    }

    /// Test: a full `Block` subscriber makes send time out after still
    /// delivering to the others
    #[test]
    fn block_policy_times_out() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("strict")
            .with_queue_capacity(2)
            .with_block_timeout(Duration::from_millis(50));

        let blocking = domain
            .subscriber(config.clone().with_overflow_policy(OverflowPolicy::Block))
            .unwrap();
        let lossy = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();

        publisher.send_copy(b"1").unwrap();
        publisher.send_copy(b"2").unwrap();

        let started = Instant::now();
        let err = publisher.send_copy(b"3").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));

        let newest: Vec<Vec<u8>> = std::iter::from_fn(|| lossy.try_receive().unwrap())
            .map(|s| s.to_vec())
            .collect();
        assert_eq!(newest, vec![b"2".to_vec(), b"3".to_vec()]);

        let kept: Vec<Vec<u8>> = std::iter::from_fn(|| blocking.try_receive().unwrap())
            .map(|s| s.to_vec())
            .collect();
        assert_eq!(kept, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    /// Test: a blocked publisher resumes as soon as the subscriber drains
    #[test]
    fn block_policy_resumes() {
        let dir = TempDir::new().unwrap();
        let domain = Arc::new(domain(&dir));
        let config = topic("resume")
            .with_queue_capacity(2)
            .with_block_timeout(Duration::from_secs(5));

        let subscriber = domain
            .subscriber(config.clone().with_overflow_policy(OverflowPolicy::Block))
            .unwrap();
        let publisher = domain.publisher(config).unwrap();

        let total = 50u64;
        let reader = thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < total as usize {
                let sample = subscriber.receive_timeout(Some(Duration::from_secs(5))).unwrap();
                seen.push(sample.read_pod::<u64>().unwrap());
            }
            seen
        });

        for i in 0..total {
            publisher.send_pod(&i).unwrap();
        }

        let seen = reader.join().unwrap();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());
    }

    /// Test: a `Block` publisher waits for a free slot instead of failing
    #[test]
    fn block_loan_times_out_on_exhausted_pool() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("loan")
            .with_pool_capacity(1)
            .with_overflow_policy(OverflowPolicy::Block)
            .with_block_timeout(Duration::from_millis(30));
        let publisher = domain.publisher(config).unwrap();

        let held = publisher.loan().unwrap();
        assert_eq!(publisher.loan().unwrap_err().kind(), ErrorKind::Timeout);
        drop(held);
        assert!(publisher.loan().is_ok());
    }

    /// Test: blocking receive wakes on a sample from another thread
    #[test]
    fn receive_wakes_on_send() {
        let dir = TempDir::new().unwrap();
        let domain = Arc::new(domain(&dir));
        let subscriber = domain.subscriber(topic("wake")).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let sender_domain = Arc::clone(&domain);
        let sender_barrier = Arc::clone(&barrier);
        let sender = thread::spawn(move || {
            let publisher = sender_domain.publisher(topic("wake")).unwrap();
            sender_barrier.wait();
            thread::sleep(Duration::from_millis(20));
            publisher.send_copy(b"ping").unwrap();
            // Keep the publisher until the sample was read.
            sender_barrier.wait();
        });

        barrier.wait();
        let sample = subscriber.receive_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(&sample[..], b"ping");
        drop(sample);
        barrier.wait();
        sender.join().unwrap();
    }

    /// Test: receive with a deadline and nothing sent fails with `Timeout`
    #[test]
    fn receive_timeout_expires() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let subscriber = domain
            .subscriber(topic("quiet").with_receive_timeout(Some(Duration::from_millis(30))))
            .unwrap();

        assert!(subscriber.try_receive().unwrap().is_none());
        let started = Instant::now();
        let err = subscriber.receive().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    /// Test: cancelling wakes a suspended receive with `Cancelled`
    #[test]
    fn cancel_wakes_receive() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let subscriber = domain.subscriber(topic("cancel")).unwrap();
        let publisher = domain.publisher(topic("cancel")).unwrap();
        let cancel = subscriber.cancel_handle();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });

        let err = subscriber.receive_timeout(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        canceller.join().unwrap();

        // Cancelled subscribers no longer receive.
        assert_eq!(publisher.send_copy(b"late").unwrap(), 0);
        assert_eq!(subscriber.try_receive().unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    /// Test: a mismatched payload type is rejected at connect
    #[test]
    fn incompatible_type_rejected() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);

        let _imu = domain.publisher(TopicConfig::for_type::<Imu>("sensor")).unwrap();
        let err = domain
            .subscriber(TopicConfig::for_type::<u64>("sensor"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);

        let err = domain
            .subscriber(
                TopicConfig::for_type::<Imu>("sensor")
                    .with_type_descriptor(TypeDescriptor::of::<Imu>().with_schema_hash(1)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Incompatible);
    }

    /// Test: the endpoint table has a fixed number of entries
    #[test]
    fn endpoint_limit() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("limited").with_max_publishers(1);

        let first = domain.publisher(config.clone()).unwrap();
        let err = domain.publisher(config.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        first.disconnect().unwrap();
        assert!(domain.publisher(config).is_ok());
    }

    /// Test: payload checksums verify what subscribers read
    #[test]
    fn checksummed_topic() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let config = topic("crc").with_checksums(true);

        let subscriber = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();

        publisher.send_copy(b"integrity").unwrap();
        let sample = subscriber.try_receive().unwrap().unwrap();
        assert_eq!(&sample[..], b"integrity");
    }

    /// Test: the segment disappears with its last endpoint unless persistent
    #[test]
    fn segment_lifetime() {
        let dir = TempDir::new().unwrap();
        let domain = domain(&dir);
        let path = dir.path().join("robot").join("temp.seg");

        let publisher = domain.publisher(topic("temp")).unwrap();
        let subscriber = domain.subscriber(topic("temp")).unwrap();
        assert!(path.exists());

        drop(publisher);
        assert!(path.exists());
        subscriber.disconnect().unwrap();
        assert!(!path.exists());

        let config = topic("kept").with_persistent(true);
        let kept = dir.path().join("robot").join("kept.seg");
        drop(domain.publisher(config).unwrap());
        assert!(kept.exists());
        assert!(domain.remove_topic("kept").unwrap());
        assert!(!kept.exists());
    }

    /// Test: many publishers in parallel; per-publisher order holds
    #[test]
    fn concurrent_publishers_keep_their_order() {
        let dir = TempDir::new().unwrap();
        let domain = Arc::new(domain(&dir));
        let config = topic("many")
            .with_pool_capacity(64)
            .with_queue_capacity(64)
            .with_overflow_policy(OverflowPolicy::Block)
            .with_block_timeout(Duration::from_secs(5));

        let subscriber = domain.subscriber(config.clone()).unwrap();
        let barrier = Arc::new(Barrier::new(4));
        let per_publisher = 100u64;

        let handles: Vec<_> = (0..4u64)
            .map(|p| {
                let domain = Arc::clone(&domain);
                let config = config.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let publisher = domain.publisher(config).unwrap();
                    barrier.wait();
                    for i in 0..per_publisher {
                        publisher.send_pod(&[p, i]).unwrap();
                    }
                })
            })
            .collect();

        let mut next = [0u64; 4];
        let mut received = 0;
        while received < 4 * per_publisher {
            let sample = subscriber.receive_timeout(Some(Duration::from_secs(5))).unwrap();
            let [p, i] = sample.read_pod::<[u64; 2]>().unwrap();
            assert_eq!(i, next[p as usize]);
            next[p as usize] += 1;
            received += 1;
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(next, [per_publisher; 4]);
    }

    /// Test: subscribers leaving while a publisher fans out never strand a
    /// reference in the queue they abandoned
    #[test]
    fn subscriber_churn_during_send_keeps_pool_whole() {
        let dir = TempDir::new().unwrap();
        let domain = Arc::new(domain(&dir));
        let config = topic("churn").with_pool_capacity(8).with_queue_capacity(2);
        let publisher = domain.publisher(config.clone()).unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let churn = {
            let domain = Arc::clone(&domain);
            let config = config.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                for _ in 0..200 {
                    let subscribers: Vec<_> =
                        (0..3).map(|_| domain.subscriber(config.clone()).unwrap()).collect();
                    thread::yield_now();
                    drop(subscribers);
                }
                stop.store(true, std::sync::atomic::Ordering::Release);
            })
        };

        let mut sent = 0u64;
        while !stop.load(std::sync::atomic::Ordering::Acquire) {
            publisher.send_pod(&sent).unwrap();
            sent += 1;
        }
        churn.join().unwrap();

        let pool = domain.topics().unwrap()[0].pool.clone();
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(pool.free, 8, "{} sends left slots behind: {}", sent, pool.summary());
    }
}
