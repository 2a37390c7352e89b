//! Per-thread storage slot (spec §4.C).
//!
//! Scheduler entry points that take an optional `&Schedule` fall back to
//! whatever [`set_active_schedule`] last installed on the calling thread.
//! There is no global (cross-thread) scheduler; each thread that wants the
//! "ambient schedule" convenience must set its own.

use std::cell::{Cell, RefCell};

use crate::error::ErrorKind;
use crate::scheduler::Schedule;

struct Tls {
    active_schedule: RefCell<Option<Schedule>>,
    last_error: Cell<ErrorKind>,
}

impl Tls {
    fn new() -> Self {
        Tls {
            active_schedule: RefCell::new(None),
            last_error: Cell::new(ErrorKind::Ok),
        }
    }
}

thread_local! {
    static TLS: Tls = Tls::new();
}

/// Install `schedule` as this thread's ambient scheduler. Overwrites
/// whatever was previously installed; does not affect any other thread.
/// `Schedule` is a cheap `Clone`-able handle (an `Arc` underneath), so
/// this does not take ownership away from the caller.
pub fn set_active_schedule(schedule: Schedule) {
    TLS.with(|tls| *tls.active_schedule.borrow_mut() = Some(schedule));
}

/// Clear this thread's ambient scheduler.
pub fn clear_active_schedule() {
    TLS.with(|tls| *tls.active_schedule.borrow_mut() = None);
}

/// Returns this thread's ambient scheduler, if one has been installed.
pub fn active_schedule() -> Option<Schedule> {
    TLS.with(|tls| tls.active_schedule.borrow().clone())
}

/// Record the kind of the most recent failure on this thread. Called by
/// every fallible operation in this crate immediately before it returns an
/// error, mirroring the C library's errno-style convention (spec §7).
pub fn set_last_error(kind: ErrorKind) {
    TLS.with(|tls| tls.last_error.set(kind));
}

/// The kind of the last error set on this thread, or [`ErrorKind::Ok`] if
/// none has been set yet.
pub fn last_error() -> ErrorKind {
    TLS.with(|tls| tls.last_error.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;

    #[test]
    fn last_error_defaults_to_ok_and_is_per_thread() {
        clear_active_schedule();
        assert_eq!(last_error(), ErrorKind::Ok);
        set_last_error(ErrorKind::Overflow);
        assert_eq!(last_error(), ErrorKind::Overflow);

        let handle = std::thread::spawn(|| last_error());
        assert_eq!(handle.join().unwrap(), ErrorKind::Ok);
    }

    #[test]
    fn active_schedule_round_trips() {
        assert!(active_schedule().is_none());
        let schedule = Schedule::new(ScheduleConfig::default()).unwrap();
        set_active_schedule(schedule.clone());
        assert!(active_schedule().is_some());
        clear_active_schedule();
        assert!(active_schedule().is_none());
    }
}
