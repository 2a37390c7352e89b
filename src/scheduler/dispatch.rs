//! The per-iteration dispatch phases (spec §4.D.2/§4.D.3), split out of
//! [`super::Schedule`]'s public API surface. Grounded on
//! `silc_schedule_dispatch_fd`, `silc_schedule_dispatch_timeout` and
//! `silc_schedule_select_timeout` in `silcschedule.c`: unlock before
//! invoking a callback, relock to fold the result back in, because a
//! callback is allowed to call right back into the scheduler that's
//! running it.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::task::{FdCallback, TaskEvent, TimeoutTask};

use super::{recycle_timeout, run_pool_gc, Schedule};

/// One full iteration: signal drain, a first timeout sweep, a bounded
/// wait on the platform poller, fd dispatch, and — if the wait was short
/// — a second timeout sweep, so timers due just after the wait started
/// don't wait a whole extra iteration to fire.
///
/// `timeout_override` is the caller-supplied wait from
/// `Schedule::run_one` (spec §4.D.2 step 5): when present it replaces the
/// wait computed from the timeout queue rather than extending it, so a
/// caller that always passes `Some(Duration::ZERO)` gets a pure poll.
pub(super) fn run_one_impl(
    schedule: &Schedule,
    timeout_override: Option<Duration>,
) -> Result<bool, crate::error::ScheduleError> {
    if !schedule.is_valid() {
        return Ok(false);
    }

    drain_signals(schedule);
    if !schedule.is_valid() {
        return Ok(false);
    }

    dispatch_timeouts(schedule);
    if !schedule.is_valid() {
        return Ok(false);
    }

    let wait = timeout_override.or_else(|| compute_wait(schedule));
    let ready = {
        let mut guard = schedule.lock();
        guard.poller.wait(wait).unwrap_or_default()
    };

    dispatch_fd(schedule, ready);

    if wait.map(|d| d < Duration::from_millis(50)).unwrap_or(false) {
        dispatch_timeouts(schedule);
    }

    run_pool_gc(schedule);

    Ok(schedule.is_valid())
}

pub(super) fn drain_signals(schedule: &Schedule) {
    for signum in super::signal::drain_pending() {
        let taken = {
            let mut guard = schedule.lock();
            match guard.signal_tasks.get_mut(&signum) {
                Some(t) if t.valid => {
                    let cb = std::mem::replace(&mut t.callback, Box::new(|_: &Schedule, _: i32| {}));
                    Some(cb)
                }
                _ => None,
            }
        };
        let Some(mut callback) = taken else { continue };
        callback(schedule, signum);
        let mut guard = schedule.lock();
        if let Some(t) = guard.signal_tasks.get_mut(&signum) {
            t.callback = callback;
        }
    }
}

/// Dispatches every timeout task whose deadline has passed, oldest
/// first, capped at 40 per call so a burst of expired timers can't starve
/// fd readiness checks (`silc_schedule_dispatch_timeout`'s own cap).
fn dispatch_timeouts(schedule: &Schedule) {
    const DISPATCH_CAP: usize = 40;
    let mut dispatched = 0;
    loop {
        if dispatched >= DISPATCH_CAP {
            tracing::warn!(cap = DISPATCH_CAP, "timeout dispatch cap reached this iteration");
            break;
        }
        let due = {
            let mut guard = schedule.lock();
            match guard.timeout_tasks.first() {
                Some(t) if t.deadline.has_passed() => Some(guard.timeout_tasks.remove(0)),
                _ => None,
            }
        };
        let Some(task) = due else { break };
        if !task.valid {
            let mut guard = schedule.lock();
            recycle_timeout(&mut guard, task);
            continue;
        }
        dispatched += 1;
        let TimeoutTask { mut callback, .. } = task;
        tracing::trace!("dispatching timeout task");
        callback(schedule);
    }
}

/// Dispatches every pending timeout task regardless of deadline, with no
/// per-call cap — `Schedule::uninit`'s "dispatch every pending timeout
/// (ignoring deadlines)" step (spec §4.D.1), not the bounded per-iteration
/// sweep `dispatch_timeouts` runs while the loop is live.
pub(super) fn dispatch_all_timeouts(schedule: &Schedule) {
    loop {
        let next = {
            let mut guard = schedule.lock();
            if guard.timeout_tasks.is_empty() {
                None
            } else {
                Some(guard.timeout_tasks.remove(0))
            }
        };
        let Some(task) = next else { break };
        if !task.valid {
            let mut guard = schedule.lock();
            recycle_timeout(&mut guard, task);
            continue;
        }
        let TimeoutTask { mut callback, .. } = task;
        callback(schedule);
    }
}

/// Dispatches fd readiness, READ before WRITE, re-checking validity
/// between the two so a READ callback that deletes its own task doesn't
/// get a WRITE callback afterward (`silc_schedule_dispatch_fd`).
pub(super) fn dispatch_fd(schedule: &Schedule, ready: Vec<(RawFd, TaskEvent)>) {
    for (fd, revents) in ready {
        if revents.contains(TaskEvent::READ) {
            if !invoke_fd(schedule, fd, TaskEvent::READ) {
                continue;
            }
        }
        if revents.contains(TaskEvent::WRITE) {
            invoke_fd(schedule, fd, TaskEvent::WRITE);
        }
    }
    sweep_invalid_fds(schedule);
}

/// Runs the callback for `fd`/`event` if the task is still present,
/// valid, and actually requested that event. Returns whether the task
/// was (and remains) valid, so the caller can decide whether a
/// subsequent event for the same fd is still worth dispatching.
fn invoke_fd(schedule: &Schedule, fd: RawFd, event: TaskEvent) -> bool {
    let taken: Option<FdCallback> = {
        let mut guard = schedule.lock();
        match guard.fd_tasks.get_mut(&fd) {
            Some(t) if t.valid && t.requested.contains(event) => {
                Some(std::mem::replace(&mut t.callback, Box::new(|_, _, _| {})))
            }
            Some(t) => return t.valid,
            None => return false,
        }
    };
    let Some(mut callback) = taken else { return true };
    tracing::trace!(fd, ?event, "dispatching fd task");
    callback(schedule, fd, event);
    let mut guard = schedule.lock();
    match guard.fd_tasks.get_mut(&fd) {
        Some(t) => {
            t.callback = callback;
            t.valid
        }
        None => false,
    }
}

fn sweep_invalid_fds(schedule: &Schedule) {
    let mut guard = schedule.lock();
    let dead: Vec<RawFd> = guard
        .fd_tasks
        .iter()
        .filter(|(_, t)| !t.valid)
        .map(|(&fd, _)| fd)
        .collect();
    for fd in dead {
        guard.fd_tasks.remove(&fd);
        guard.poller.schedule_fd(fd, TaskEvent::empty());
    }
}

/// The wait duration for the next `poller.wait` call: `None` (block
/// indefinitely, until an fd is ready or `wakeup`/`stop` is called) when
/// there's no pending timeout, else the time remaining until the
/// earliest one.
fn compute_wait(schedule: &Schedule) -> Option<Duration> {
    let guard = schedule.lock();
    guard.timeout_tasks.first().map(|t| {
        let remaining = t.deadline.remaining();
        remaining.max(Duration::ZERO)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::task::Deadline;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn dispatch_cap_logs_and_stops_at_forty() {
        let schedule = Schedule::new(ScheduleConfig::default()).unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..45 {
            let fired = fired.clone();
            schedule
                .task_add_timeout(Deadline::after(0, 0), Box::new(move |_s| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
        dispatch_timeouts(&schedule);
        assert_eq!(fired.load(Ordering::SeqCst), 40);
        dispatch_timeouts(&schedule);
        assert_eq!(fired.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn read_then_write_and_gating_on_still_valid() {
        let schedule = Schedule::new(ScheduleConfig::default()).unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        let saw_write = Arc::new(AtomicBool::new(false));
        let saw_write_clone = saw_write.clone();
        let task = schedule
            .task_add_fd(w, TaskEvent::WRITE, Box::new(move |_s, _fd, _ev| {
                saw_write_clone.store(true, Ordering::SeqCst);
            }))
            .unwrap();
        let schedule_clone = schedule.clone();
        schedule
            .task_del(&task)
            .map(|_| ())
            .unwrap_or(());
        let _ = schedule_clone;
        dispatch_fd(&schedule, vec![(w, TaskEvent::READ | TaskEvent::WRITE)]);
        assert!(!saw_write.load(Ordering::SeqCst));
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }
}
