//! Waiting on several subscribers, listeners and timers from one thread
//!
//! Every attachment contributes its futex word to a single multi-word wait.
//! Notifications are level-triggered: an attachment keeps firing while its
//! source reports pending data, so callbacks should drain what they are
//! handed.

use std::{
    cell::{Cell, RefCell},
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use crate::{
    config::WAIT_SLICE,
    error::{Result, SeuratError},
};

use super::{deadline_after, futex};

/// Most attachments one wait set accepts
pub const MAX_ATTACHMENTS: usize = futex::MAX_WAIT_WORDS;

/// Something a [`WaitSet`] can wait on
pub trait Attachable {
    /// Word bumped whenever the source may have become ready
    fn signal_word(&self) -> &AtomicU32;

    /// Whether the source has something to hand out. Sources that were
    /// cancelled or reclaimed count as ready so the callback observes the
    /// error on its next call.
    fn is_ready(&self) -> bool;
}

/// Returned by [`WaitSet::run`] callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackProgression {
    Continue,
    Stop,
}

/// Summary of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// At least one notification or missed deadline was dispatched
    Notification,
    /// Only interval attachments fired
    Tick,
    /// Nothing fired before the timeout
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Notification,
    Tick,
    MissedDeadline,
}

/// Identifies the attachment that fired, handed to wait callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentId {
    attachment: u64,
    trigger: Trigger,
}

impl AttachmentId {
    /// The attachment behind `guard` has data or its interval elapsed
    pub fn has_event_from(&self, guard: &WaitSetGuard<'_, '_>) -> bool {
        self.attachment == guard.id && self.trigger != Trigger::MissedDeadline
    }

    /// The deadline attachment behind `guard` saw nothing in time
    pub fn has_missed_deadline(&self, guard: &WaitSetGuard<'_, '_>) -> bool {
        self.attachment == guard.id && self.trigger == Trigger::MissedDeadline
    }

    pub fn is_tick(&self) -> bool {
        self.trigger == Trigger::Tick
    }
}

enum Source<'a> {
    Notification(&'a dyn Attachable),
    Deadline {
        source: &'a dyn Attachable,
        period: Duration,
        next: Instant,
    },
    Interval {
        period: Duration,
        next: Instant,
    },
}

impl<'a> Source<'a> {
    fn attachable(&self) -> Option<&'a dyn Attachable> {
        match self {
            Source::Notification(source) | Source::Deadline { source, .. } => Some(*source),
            Source::Interval { .. } => None,
        }
    }
}

struct Attachment<'a> {
    id: u64,
    source: Source<'a>,
}

/// Multiplexes waits over many attachments.
///
/// Attach sources with the `attach_*` methods; each returns a guard that
/// detaches on drop. A wait set belongs to one thread.
pub struct WaitSet<'a> {
    attachments: RefCell<Vec<Attachment<'a>>>,
    next_id: Cell<u64>,
    capacity: usize,
}

impl<'a> WaitSet<'a> {
    /// Wait set accepting up to [`MAX_ATTACHMENTS`] attachments
    pub fn new() -> Self {
        Self {
            attachments: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            capacity: MAX_ATTACHMENTS,
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_ATTACHMENTS {
            return Err(SeuratError::invalid_parameter(
                "capacity",
                format!("Wait set capacity must be between 1 and {}", MAX_ATTACHMENTS),
            ));
        }
        Ok(Self {
            capacity,
            ..Self::new()
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.attachments.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire whenever `source` is ready
    pub fn attach_notification<T: Attachable>(&self, source: &'a T) -> Result<WaitSetGuard<'_, 'a>> {
        self.attach(Source::Notification(source))
    }

    /// Fire when `source` is ready, and report a missed deadline when it
    /// stays silent for `deadline`
    pub fn attach_deadline<T: Attachable>(
        &self,
        source: &'a T,
        deadline: Duration,
    ) -> Result<WaitSetGuard<'_, 'a>> {
        check_period("deadline", deadline)?;
        self.attach(Source::Deadline {
            source,
            period: deadline,
            next: Instant::now() + deadline,
        })
    }

    /// Fire every `period`
    pub fn attach_interval(&self, period: Duration) -> Result<WaitSetGuard<'_, 'a>> {
        check_period("interval", period)?;
        self.attach(Source::Interval {
            period,
            next: Instant::now() + period,
        })
    }

    fn attach(&self, source: Source<'a>) -> Result<WaitSetGuard<'_, 'a>> {
        let mut attachments = self.attachments.borrow_mut();
        if attachments.len() >= self.capacity {
            return Err(SeuratError::resource_exhausted(
                "wait set attachments",
                format!("All {} attachments are in use", self.capacity),
            ));
        }

        if let Some(new) = source.attachable() {
            let word = new.signal_word();
            let duplicate = attachments.iter().any(|attachment| {
                attachment
                    .source
                    .attachable()
                    .map_or(false, |existing| std::ptr::eq(existing.signal_word(), word))
            });
            if duplicate {
                return Err(SeuratError::invalid_parameter(
                    "attachment",
                    "Source is already attached to this wait set",
                ));
            }
        }

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        attachments.push(Attachment { id, source });
        Ok(WaitSetGuard { waitset: self, id })
    }

    fn detach(&self, id: u64) {
        self.attachments
            .borrow_mut()
            .retain(|attachment| attachment.id != id);
    }

    /// Dispatch whatever is ready now without blocking
    pub fn try_wait_and_process(&self, callback: impl FnMut(AttachmentId)) -> Result<WaitEvent> {
        self.wait_and_process(Some(Instant::now()), callback)
    }

    /// Wait up to `timeout` for at least one attachment to fire
    pub fn timed_wait_and_process(
        &self,
        timeout: Duration,
        callback: impl FnMut(AttachmentId),
    ) -> Result<WaitEvent> {
        self.wait_and_process(deadline_after(Some(timeout)), callback)
    }

    /// Wait until at least one attachment fires
    pub fn blocking_wait_and_process(&self, callback: impl FnMut(AttachmentId)) -> Result<WaitEvent> {
        self.wait_and_process(None, callback)
    }

    /// Keep waiting and dispatching until the callback returns `Stop`
    pub fn run(&self, mut callback: impl FnMut(AttachmentId) -> CallbackProgression) -> Result<()> {
        let mut stop = false;
        while !stop {
            self.blocking_wait_and_process(|id| {
                if !stop && callback(id) == CallbackProgression::Stop {
                    stop = true;
                }
            })?;
        }
        Ok(())
    }

    fn wait_and_process(
        &self,
        deadline: Option<Instant>,
        mut callback: impl FnMut(AttachmentId),
    ) -> Result<WaitEvent> {
        if self.is_empty() {
            return Err(SeuratError::invalid_parameter(
                "waitset",
                "Nothing is attached to wait on",
            ));
        }

        loop {
            let now = Instant::now();
            let (words, fired, next_timer) = self.collect(now);

            if !fired.is_empty() {
                let event = if fired.iter().all(AttachmentId::is_tick) {
                    WaitEvent::Tick
                } else {
                    WaitEvent::Notification
                };
                // Callbacks may drop guards, so no borrow is held here.
                for id in fired {
                    callback(id);
                }
                return Ok(event);
            }

            let mut wake_at = now + WAIT_SLICE;
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(WaitEvent::Timeout);
                }
                wake_at = wake_at.min(deadline);
            }
            if let Some(timer) = next_timer {
                wake_at = wake_at.min(timer);
            }

            futex::wait_any(&words, wake_at.saturating_duration_since(now));
        }
    }

    /// Snapshot every signal word, then collect what fired and when the
    /// earliest timer is due
    #[allow(clippy::type_complexity)]
    fn collect(&self, now: Instant) -> (Vec<(&'a AtomicU32, u32)>, Vec<AttachmentId>, Option<Instant>) {
        let mut attachments = self.attachments.borrow_mut();

        let words: Vec<_> = attachments
            .iter()
            .filter_map(|attachment| attachment.source.attachable())
            .map(|source| {
                let word = source.signal_word();
                (word, word.load(Ordering::Acquire))
            })
            .collect();

        let mut fired = Vec::new();
        let mut next_timer: Option<Instant> = None;
        for attachment in attachments.iter_mut() {
            let id = attachment.id;
            let trigger = match &mut attachment.source {
                Source::Notification(source) => source.is_ready().then_some(Trigger::Notification),
                Source::Deadline { source, period, next } => {
                    let trigger = if source.is_ready() {
                        Some(Trigger::Notification)
                    } else if now >= *next {
                        Some(Trigger::MissedDeadline)
                    } else {
                        None
                    };
                    if trigger.is_some() {
                        *next = now + *period;
                    }
                    next_timer = Some(next_timer.map_or(*next, |t| t.min(*next)));
                    trigger
                }
                Source::Interval { period, next } => {
                    let trigger = if now >= *next {
                        *next += *period;
                        if *next <= now {
                            *next = now + *period;
                        }
                        Some(Trigger::Tick)
                    } else {
                        None
                    };
                    next_timer = Some(next_timer.map_or(*next, |t| t.min(*next)));
                    trigger
                }
            };

            if let Some(trigger) = trigger {
                fired.push(AttachmentId {
                    attachment: id,
                    trigger,
                });
            }
        }

        (words, fired, next_timer)
    }
}

impl Default for WaitSet<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitSet")
            .field("attachments", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn check_period(parameter: &str, period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(SeuratError::invalid_parameter(
            parameter,
            "Period must be greater than zero",
        ));
    }
    Ok(())
}

/// Keeps an attachment alive; dropping it detaches
pub struct WaitSetGuard<'w, 'a> {
    waitset: &'w WaitSet<'a>,
    id: u64,
}

impl Drop for WaitSetGuard<'_, '_> {
    fn drop(&mut self) {
        self.waitset.detach(self.id);
    }
}

impl std::fmt::Debug for WaitSetGuard<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitSetGuard").field("id", &self.id).finish()
    }
}
