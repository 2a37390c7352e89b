//! Platform adapter (spec §4.D, §10.6): the seam between the scheduler's
//! generic dispatch loop and the OS's readiness-notification and signal
//! facilities. A `Schedule` holds one `Box<dyn Poller>`; tests can swap
//! in a fake without touching `nix`/`libc` at all.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::{close, pipe, read, write};

use crate::task::TaskEvent;

/// Five-operation interface a scheduler drives its event loop through.
/// Grounded on the `silc_schedule_init`/`_uninit`/`set_listen_fd`/
/// `wait`/`wakeup` contract in `silcschedule.h`.
pub trait Poller: Send {
    fn init(&mut self) -> nix::Result<()>;
    fn uninit(&mut self);
    /// The descriptor a foreign thread or signal handler can write a
    /// byte to in order to interrupt a blocked [`Poller::wait`].
    fn wakeup_fd(&self) -> RawFd;
    /// Registers or updates the interest set for `fd`. An empty mask
    /// unregisters it.
    fn schedule_fd(&mut self, fd: RawFd, events: TaskEvent);
    /// Blocks until a descriptor is ready, `timeout` elapses, or
    /// `wakeup` is called from another thread, whichever first. Returns
    /// the set of descriptors found ready.
    fn wait(&mut self, timeout: Option<Duration>) -> nix::Result<Vec<(RawFd, TaskEvent)>>;
    /// Interrupts a concurrent or future `wait` call. Safe to call from
    /// any thread, including from within a task callback running on the
    /// scheduler's own thread.
    fn wakeup(&mut self);
    fn signal_register(&mut self, signal: Signal) -> nix::Result<()>;
    fn signal_unregister(&mut self, signal: Signal) -> nix::Result<()>;
}

/// A [`Poller`] backed by `poll(2)`, with a self-pipe for `wakeup` so a
/// call from a foreign thread can interrupt a blocked `wait` without a
/// signal race. Signal delivery funnels through the same pipe:
/// [`crate::scheduler::signal`] installs handlers that write a byte
/// here, which is how "a signal arrived" turns into "poll returns".
pub struct PollPoller {
    fds: HashMap<RawFd, TaskEvent>,
    wakeup_read: RawFd,
    wakeup_write: RawFd,
}

impl PollPoller {
    pub fn new() -> nix::Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        Ok(PollPoller {
            fds: HashMap::new(),
            wakeup_read: read_fd,
            wakeup_write: write_fd,
        })
    }

    fn to_poll_flags(events: TaskEvent) -> PollFlags {
        let mut flags = PollFlags::empty();
        if events.contains(TaskEvent::READ) {
            flags |= PollFlags::POLLIN;
        }
        if events.contains(TaskEvent::WRITE) {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    fn from_revents(revents: PollFlags) -> TaskEvent {
        let mut events = TaskEvent::empty();
        if revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP) {
            events |= TaskEvent::READ;
        }
        if revents.contains(PollFlags::POLLOUT) {
            events |= TaskEvent::WRITE;
        }
        if revents.contains(PollFlags::POLLERR) {
            events |= TaskEvent::READ | TaskEvent::WRITE;
        }
        events
    }
}

impl Poller for PollPoller {
    fn init(&mut self) -> nix::Result<()> {
        Ok(())
    }

    fn uninit(&mut self) {
        let _ = close(self.wakeup_read);
        let _ = close(self.wakeup_write);
    }

    fn wakeup_fd(&self) -> RawFd {
        self.wakeup_write
    }

    fn schedule_fd(&mut self, fd: RawFd, events: TaskEvent) {
        if events.is_empty() {
            self.fds.remove(&fd);
        } else {
            self.fds.insert(fd, events);
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> nix::Result<Vec<(RawFd, TaskEvent)>> {
        let mut poll_fds: Vec<PollFd> = Vec::with_capacity(self.fds.len() + 1);
        let wakeup_borrow = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.wakeup_read) };
        poll_fds.push(PollFd::new(wakeup_borrow, PollFlags::POLLIN));
        let fds_snapshot: Vec<(RawFd, TaskEvent)> = self.fds.iter().map(|(&fd, &ev)| (fd, ev)).collect();
        for &(fd, events) in &fds_snapshot {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            poll_fds.push(PollFd::new(borrowed, Self::to_poll_flags(events)));
        }

        let poll_timeout: PollTimeout = match timeout {
            Some(d) => (d.as_millis().min(u16::MAX as u128) as u16).into(),
            None => PollTimeout::NONE,
        };
        nix::poll::poll(&mut poll_fds, poll_timeout)?;

        let mut ready = Vec::new();
        if let Some(revents) = poll_fds[0].revents() {
            if revents.contains(PollFlags::POLLIN) {
                let mut buf = [0u8; 64];
                let _ = read(self.wakeup_read, &mut buf);
            }
        }
        for (i, &(fd, _)) in fds_snapshot.iter().enumerate() {
            if let Some(revents) = poll_fds[i + 1].revents() {
                if !revents.is_empty() {
                    ready.push((fd, Self::from_revents(revents)));
                }
            }
        }
        Ok(ready)
    }

    fn wakeup(&mut self) {
        let _ = write(self.wakeup_write, &[1u8]);
    }

    fn signal_register(&mut self, _signal: Signal) -> nix::Result<()> {
        // Actual sigaction installation lives in `super::signal`, which
        // shares this poller's wakeup pipe; this adapter only owns the
        // fd side of the self-pipe trick.
        Ok(())
    }

    fn signal_unregister(&mut self, _signal: Signal) -> nix::Result<()> {
        Ok(())
    }
}
