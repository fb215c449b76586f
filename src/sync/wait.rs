//! Blocking waiter.
//!
//! Drives a [`Flow`] to completion by waiting for socket readiness with
//! `poll(2)`, using a short internal tick so signals stay responsive.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::{Error, Result};
use crate::state::{Flow, Ready, Step, Wait};

const POLL_TICK_MS: u16 = 100;

/// Run a flow to completion, blocking on readiness as requested.
pub(crate) fn drive<F: Flow>(mut flow: F) -> Result<F::Output> {
    let mut ready = None;
    loop {
        match flow.resume(ready.take())? {
            Step::Done(output) => return Ok(output),
            Step::Wait(fd, wait) => ready = Some(wait_ready(fd, wait)?),
        }
    }
}

fn wait_ready(fd: RawFd, wait: Wait) -> Result<Ready> {
    let mut flags = PollFlags::empty();
    if matches!(wait, Wait::Read | Wait::ReadWrite) {
        flags |= PollFlags::POLLIN;
    }
    if matches!(wait, Wait::Write | Wait::ReadWrite) {
        flags |= PollFlags::POLLOUT;
    }

    loop {
        // SAFETY: the descriptor belongs to the protocol handle, which the
        // caller keeps alive for the duration of the wait.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, flags)];
        match poll(&mut fds, PollTimeout::from(POLL_TICK_MS)) {
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Operational(format!("poll failed: {e}"))),
            Ok(0) => continue,
            Ok(_) => {}
        }

        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(Error::Operational("poll failed: invalid socket".into()));
        }
        // Errors and hangups are surfaced by letting the handle read.
        let readable =
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP);
        let writable =
            revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP);
        match wait {
            Wait::Read | Wait::ReadWrite if readable => return Ok(Ready::Read),
            Wait::Write | Wait::ReadWrite if writable => return Ok(Ready::Write),
            _ => {}
        }
    }
}
