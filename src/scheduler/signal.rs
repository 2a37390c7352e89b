//! Signal intake (spec §4.D.1, `task_add_signal`).
//!
//! POSIX signal handlers may only call async-signal-safe functions, which
//! rules out running a task's callback (an arbitrary Rust closure,
//! possibly allocating) directly from the handler. The handler instead
//! sets a bit in [`PENDING`] and pokes the scheduler's wakeup pipe; the
//! dispatch loop's signal-drain phase (`super::dispatch`) reads the
//! bitmask back on the scheduler's own thread and runs callbacks there,
//! where allocation and locking are safe again.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::write;

static PENDING: AtomicU64 = AtomicU64::new(0);
static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handler(signum: i32) {
    if (1..64).contains(&signum) {
        PENDING.fetch_or(1u64 << signum, Ordering::SeqCst);
    }
    let fd = WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let _ = write(fd, &[1u8]);
    }
}

/// Tells the signal handler which fd to poke on delivery. A process has
/// one handler table, so this is necessarily process-wide; the last
/// scheduler to call `task_add_signal` wins. Matches the source's own
/// assumption that signal handling is process-global (`silcschedule.c`).
pub fn set_wakeup_fd(fd: RawFd) {
    WAKEUP_FD.store(fd, Ordering::SeqCst);
}

/// Installs the shared handler for `signal`. Safe to call from any
/// thread; POSIX signal dispositions are process-wide regardless.
pub fn register(signal: Signal) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(handler), SaFlags::SA_RESTART, SigSet::empty());
    unsafe { sigaction(signal, &action) }.map(|_| ())
}

/// Restores the default disposition for `signal`.
pub fn unregister(signal: Signal) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }.map(|_| ())
}

/// Atomically takes and clears the set of signals that arrived since the
/// last call, returning them as signal numbers.
pub fn drain_pending() -> Vec<i32> {
    let bits = PENDING.swap(0, Ordering::SeqCst);
    (1..64).filter(|&signum| bits & (1u64 << signum) != 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_pending_is_empty_with_nothing_set() {
        let _ = PENDING.swap(0, Ordering::SeqCst);
        assert!(drain_pending().is_empty());
    }

    #[test]
    fn handler_sets_and_drain_clears_the_bit() {
        let _ = PENDING.swap(0, Ordering::SeqCst);
        handler(Signal::SIGUSR1 as i32);
        let pending = drain_pending();
        assert_eq!(pending, vec![Signal::SIGUSR1 as i32]);
        assert!(drain_pending().is_empty());
    }
}
