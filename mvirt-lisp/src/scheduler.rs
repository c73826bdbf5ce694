//! Deadline-based timer registry.
//!
//! The scheduler knows nothing about LISP: it stores an opaque context per
//! timer and hands the contexts of due timers back to the caller. Whether a
//! timer is due is always derived from its deadline and the `now` passed in,
//! never from how many timer signals were delivered, so coalesced wakeups
//! are harmless.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

/// Opaque identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer({})", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Deadline lies {0:?} in the past")]
    InvalidDeadline(Duration),

    #[error("Periodic timer needs a non-zero period")]
    ZeroPeriod,
}

struct Timer<C> {
    deadline: Instant,
    period: Option<Duration>,
    context: C,
}

/// Registry of one-shot and periodic timers.
pub struct RetryScheduler<C> {
    next_id: u64,
    timers: HashMap<TimerHandle, Timer<C>>,
    /// Ordered by deadline, ties broken by creation order.
    queue: BTreeSet<(Instant, TimerHandle)>,
}

impl<C: Clone> RetryScheduler<C> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            timers: HashMap::new(),
            queue: BTreeSet::new(),
        }
    }

    /// Register a timer firing at `deadline`, then every `period` if set.
    ///
    /// A deadline equal to `now` is allowed and fires on the next drain.
    pub fn schedule(
        &mut self,
        deadline: Instant,
        period: Option<Duration>,
        context: C,
        now: Instant,
    ) -> Result<TimerHandle, SchedulerError> {
        if deadline < now {
            return Err(SchedulerError::InvalidDeadline(now - deadline));
        }
        if period.is_some_and(|p| p.is_zero()) {
            return Err(SchedulerError::ZeroPeriod);
        }

        let handle = TimerHandle(self.next_id);
        self.next_id += 1;

        self.queue.insert((deadline, handle));
        self.timers.insert(
            handle,
            Timer {
                deadline,
                period,
                context,
            },
        );
        trace!(%handle, ?period, "Timer scheduled");
        Ok(handle)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.timers.remove(&handle) {
            Some(timer) => {
                self.queue.remove(&(timer.deadline, handle));
                trace!(%handle, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Collect the contexts of every timer due at or before `now`.
    ///
    /// One-shot timers are removed. Periodic timers are re-armed at
    /// `deadline + period`; if the loop fell behind by several periods they
    /// fire once and skip to the first deadline after `now`.
    pub fn drain_due(&mut self, now: Instant) -> Vec<C> {
        let mut fired = Vec::new();

        while let Some(&(deadline, handle)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.pop_first();

            let Some(timer) = self.timers.remove(&handle) else {
                continue;
            };

            match timer.period {
                Some(period) => {
                    let next = next_periodic_deadline(timer.deadline, period, now);
                    fired.push(timer.context.clone());
                    self.queue.insert((next, handle));
                    self.timers.insert(
                        handle,
                        Timer {
                            deadline: next,
                            ..timer
                        },
                    );
                }
                None => fired.push(timer.context),
            }
        }

        fired
    }

    /// Deadline of a live timer.
    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.timers.get(&handle).map(|t| t.deadline)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|(d, _)| *d)
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<C: Clone> Default for RetryScheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// First `deadline + k * period` (k >= 1) strictly after `now`.
/// Stands in for "never" when a deadline does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// `now + after`, clamped instead of panicking on overflow.
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn next_periodic_deadline(deadline: Instant, period: Duration, now: Instant) -> Instant {
    let next = deadline_after(deadline, period);
    if next > now {
        return next;
    }
    let behind = now.duration_since(deadline).as_nanos();
    let periods = behind / period.as_nanos() + 1;
    let skip = u64::try_from(period.as_nanos() * periods).unwrap_or(u64::MAX);
    deadline_after(deadline, Duration::from_nanos(skip))
}
