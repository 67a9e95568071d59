//! Blocking primitives built on shared futex words
//!
//! Every wait is sliced into `WAIT_SLICE` pieces so that a crashed peer or a
//! cancelled handle is noticed even when nobody wakes the waiter.

pub mod futex;
pub mod waitset;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use crate::{config::WAIT_SLICE, error::Result};

pub use waitset::{Attachable, AttachmentId, CallbackProgression, WaitEvent, WaitSet, WaitSetGuard};

/// Turn an optional timeout into an optional deadline
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

/// Poll `ready` until it yields a value, waiting on `word` between attempts.
///
/// Uses the snapshot / re-poll / wait sequence so a signal sent between the
/// first poll and the wait is never lost. Returns `Ok(None)` once `deadline`
/// passes; errors from `ready` end the wait immediately.
pub fn wait_until<T>(
    word: &AtomicU32,
    deadline: Option<Instant>,
    mut ready: impl FnMut() -> Result<Option<T>>,
) -> Result<Option<T>> {
    loop {
        if let Some(value) = ready()? {
            return Ok(Some(value));
        }

        let snapshot = word.load(Ordering::Acquire);

        if let Some(value) = ready()? {
            return Ok(Some(value));
        }

        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                (deadline - now).min(WAIT_SLICE)
            }
            None => WAIT_SLICE,
        };

        futex::wait(word, snapshot, slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SeuratError;

    #[test]
    fn test_wait_until_ready_immediately() {
        let word = AtomicU32::new(0);
        let value = wait_until(&word, None, || Ok(Some(7))).unwrap();
        assert_eq!(value, Some(7));
    }

    #[test]
    fn test_wait_until_deadline() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let value: Option<()> =
            wait_until(&word, deadline_after(Some(Duration::from_millis(30))), || Ok(None)).unwrap();
        assert!(value.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_until_propagates_errors() {
        let word = AtomicU32::new(0);
        let result: Result<Option<()>> =
            wait_until(&word, None, || Err(SeuratError::cancelled("test")));
        assert!(result.is_err());
    }

    #[test]
    fn test_wait_until_polls_across_slices() {
        let word = AtomicU32::new(0);
        let mut calls = 0;
        let value = wait_until(&word, None, || {
            calls += 1;
            Ok(if calls > 4 { Some(calls) } else { None })
        })
        .unwrap();
        assert_eq!(value, Some(5));
    }
}
