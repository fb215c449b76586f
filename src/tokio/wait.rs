//! Cooperative waiter.
//!
//! Drives a [`Flow`] to completion by registering the handle's descriptor
//! with the tokio reactor and awaiting readiness. Cancellation propagates:
//! dropping the future abandons the in-flight command.

use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::error::Result;
use crate::state::{Flow, Ready, Step, Wait};

/// Borrowed descriptor wrapper for reactor registration. Dropping it does
/// not close the descriptor; the protocol handle owns it.
struct RawSocket(RawFd);

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Run a flow to completion, awaiting readiness as requested.
pub(crate) async fn drive<F: Flow>(mut flow: F) -> Result<F::Output> {
    let mut ready = None;
    loop {
        match flow.resume(ready.take())? {
            Step::Done(output) => return Ok(output),
            Step::Wait(fd, wait) => ready = Some(wait_ready(fd, wait).await?),
        }
    }
}

async fn wait_ready(fd: RawFd, wait: Wait) -> Result<Ready> {
    let interest = match wait {
        Wait::Read => Interest::READABLE,
        Wait::Write => Interest::WRITABLE,
        Wait::ReadWrite => Interest::READABLE | Interest::WRITABLE,
    };
    let afd = AsyncFd::with_interest(RawSocket(fd), interest)?;
    let mut guard = afd.ready(interest).await?;
    let readiness = guard.ready();
    guard.clear_ready();

    Ok(match wait {
        Wait::Read => Ready::Read,
        Wait::Write => Ready::Write,
        Wait::ReadWrite => {
            // Hangups count as readable so the handle observes the failure.
            if readiness.is_readable() || readiness.is_read_closed() {
                Ready::Read
            } else {
                Ready::Write
            }
        }
    })
}
