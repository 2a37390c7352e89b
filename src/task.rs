//! Task records (spec §3, §4.D).
//!
//! A task is one of four kinds — `Fd`, `Timeout`, `Signal`, `Event` — each
//! carrying a boxed callback closure instead of the original C API's
//! function-pointer-plus-opaque-context pair. The closure captures
//! whatever context it needs directly, which is the idiomatic
//! replacement: see `silcschedule.h`'s `SilcTaskCallback` for the shape
//! this replaces.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::event::EventPayload;
use crate::scheduler::Schedule;

bitflags! {
    /// Readiness/registration mask. Values match the original
    /// `SilcTaskEvent` bit assignment (`SILC_TASK_READ` = 0x0001, etc.)
    /// so that a caller porting bit-level logic from the source doesn't
    /// have to relearn the numbering.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct TaskEvent: u32 {
        const READ      = 0x0001;
        const WRITE     = 0x0002;
        const EXPIRE    = 0x0004;
        const INTERRUPT = 0x0008;
    }
}

/// Monotonic deadline for a timeout task. Exposed to callers only through
/// `Deadline::after`, which takes the same (seconds, microseconds) shape
/// the source API does; internally it's backed by [`Instant`] so the
/// scheduler's ordering can't be perturbed by a wall-clock adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(secs: u64, micros: u64) -> Deadline {
        Deadline(Instant::now() + Duration::from_secs(secs) + Duration::from_micros(micros))
    }

    pub fn now() -> Deadline {
        Deadline(Instant::now())
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn has_passed(&self) -> bool {
        self.0 <= Instant::now()
    }
}

static_assertions::const_assert_eq!(TaskEvent::READ.bits(), 0x0001);
static_assertions::const_assert_eq!(TaskEvent::WRITE.bits(), 0x0002);
static_assertions::const_assert_eq!(TaskEvent::EXPIRE.bits(), 0x0004);
static_assertions::const_assert_eq!(TaskEvent::INTERRUPT.bits(), 0x0008);

pub type FdCallback = Box<dyn FnMut(&Schedule, RawFd, TaskEvent) + Send>;
pub type TimeoutCallback = Box<dyn FnMut(&Schedule) + Send>;
pub type SignalCallback = Box<dyn FnMut(&Schedule, i32) + Send>;
/// Returns `true` to stay subscribed, `false` to self-unsubscribe.
pub type EventCallback = Box<dyn FnMut(&Schedule, &EventPayload) -> bool + Send>;

pub(crate) struct FdTask {
    pub id: TaskId,
    pub fd: RawFd,
    pub requested: TaskEvent,
    pub valid: bool,
    pub callback: FdCallback,
}

pub(crate) struct TimeoutTask {
    pub id: TaskId,
    pub deadline: Deadline,
    pub valid: bool,
    pub callback: TimeoutCallback,
}

pub(crate) struct SignalTask {
    pub id: TaskId,
    pub signum: i32,
    pub valid: bool,
    pub callback: SignalCallback,
}

pub(crate) struct EventSubscriber {
    pub id: TaskId,
    pub valid: bool,
    /// The schedule that registered this subscriber — not necessarily the
    /// root the event itself lives on (spec §4.D.4/S6: a subscriber
    /// registered via a child runs in that child's own thread).
    pub owner: Schedule,
    pub callback: EventCallback,
}

pub(crate) struct EventTask {
    pub name: String,
    pub subscribers: Vec<EventSubscriber>,
    /// Set by a whole-event deletion (as opposed to a single subscriber's)
    /// so an in-flight `event_signal` walk stops at the next subscriber
    /// rather than finishing the round — the entry itself is removed a
    /// microsecond later, same deferred-removal discipline as a single
    /// subscriber delete.
    pub deleted: bool,
}

/// Monotonically increasing identifier, unique within a single
/// [`Schedule`]'s lifetime (including its children, which share the
/// counter through the parent).
pub type TaskId = u64;

/// A handle returned by `task_add_*`, passed back to `task_del`. Opaque
/// to callers beyond equality; callers that need the fd/name back can
/// match on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Fd(RawFd),
    Timeout(TaskId),
    Signal(i32),
    Event(String, TaskId),
}
