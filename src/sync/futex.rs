//! Cross-process wait/wake on 32-bit words inside a segment
//!
//! On Linux this is a non-private futex so waiters in other processes mapping
//! the same file are woken. Elsewhere waiters sleep in short slices and
//! re-check the word.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

/// Most words one `futex_waitv` call accepts (the kernel's FUTEX_WAITV_MAX)
pub const MAX_WAIT_WORDS: usize = 128;

/// Sleep slice used when polling instead of blocking in the kernel
const POLL: Duration = Duration::from_millis(1);

/// Block while `word == expected`, for at most `timeout`.
///
/// Returns early on wake-ups, spurious wake-ups and signals; callers always
/// re-check their condition.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // The kernel compares the word atomically, so a wake between our load and
    // the syscall makes it return EAGAIN immediately.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    poll_any(&[(word, expected)], timeout);
}

/// Block while every `(word, expected)` pair still matches, for at most
/// `timeout`.
///
/// Uses `futex_waitv` where the kernel has it (Linux 5.16+) and falls back to
/// sliced polling otherwise. Like [`wait`], callers re-check their condition
/// after every return.
pub fn wait_any(words: &[(&AtomicU32, u32)], timeout: Duration) {
    if words.is_empty() {
        std::thread::sleep(timeout);
        return;
    }

    #[cfg(target_os = "linux")]
    {
        if words.len() <= MAX_WAIT_WORDS && waitv::wait(words, timeout) {
            return;
        }
    }

    poll_any(words, timeout);
}

fn poll_any(words: &[(&AtomicU32, u32)], timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while words
        .iter()
        .all(|(word, expected)| word.load(Ordering::Acquire) == *expected)
    {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(POLL.min(deadline - now));
    }
}

#[cfg(target_os = "linux")]
mod waitv {
    use std::{
        sync::atomic::{AtomicBool, AtomicU32, Ordering},
        time::Duration,
    };

    /// Same number on every architecture (added after the syscall table merge)
    const SYS_FUTEX_WAITV: libc::c_long = 449;
    const FUTEX2_SIZE_U32: u32 = 0x02;
    const NANOS_PER_SEC: u64 = 1_000_000_000;

    #[repr(C)]
    struct FutexWaitv {
        val: u64,
        uaddr: u64,
        flags: u32,
        reserved: u32,
    }

    static UNAVAILABLE: AtomicBool = AtomicBool::new(false);

    /// Returns `false` when the kernel refused the call and the caller has
    /// to poll instead
    pub(super) fn wait(words: &[(&AtomicU32, u32)], timeout: Duration) -> bool {
        if UNAVAILABLE.load(Ordering::Relaxed) {
            return false;
        }

        let waiters: Vec<FutexWaitv> = words
            .iter()
            .map(|(word, expected)| FutexWaitv {
                val: *expected as u64,
                uaddr: *word as *const AtomicU32 as usize as u64,
                flags: FUTEX2_SIZE_U32,
                reserved: 0,
            })
            .collect();

        // futex_waitv only takes an absolute timeout.
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
        let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let secs = timeout.as_secs().min(u32::MAX as u64) + nanos / NANOS_PER_SEC;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec.saturating_add(secs as libc::time_t),
            tv_nsec: (nanos % NANOS_PER_SEC) as libc::c_long,
        };

        let rc = unsafe {
            libc::syscall(
                SYS_FUTEX_WAITV,
                waiters.as_ptr(),
                waiters.len() as libc::c_uint,
                0u32,
                &deadline as *const libc::timespec,
                libc::CLOCK_MONOTONIC,
            )
        };

        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error();
            if matches!(errno, Some(libc::ENOSYS) | Some(libc::EPERM)) {
                log::debug!("futex_waitv unavailable ({:?}), polling instead", errno);
                UNAVAILABLE.store(true, Ordering::Relaxed);
                return false;
            }
        }
        true
    }
}

/// Wake every waiter blocked on `word`
#[cfg(target_os = "linux")]
pub fn wake_all(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wake_all(_word: &AtomicU32) {}

/// Bump `word` and wake its waiters
pub fn signal(word: &AtomicU32) {
    word.fetch_add(1, Ordering::Release);
    wake_all(word);
}
