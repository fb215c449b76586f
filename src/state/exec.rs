//! Query execution flow.

use crate::error::{Error, Result};
use crate::pq::{PqResult, ProtocolHandle};

use super::{Flow, Ready, Step, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Flush,
    Collect,
    Finished,
}

/// Flow that collects the results of a query without blocking.
///
/// The query must have already been queued with
/// [`ProtocolHandle::send_query`]. The flow first drains the write buffer,
/// reading any input the server sends in the meantime, then collects
/// results until the end-of-batch marker.
pub struct ExecFlow<'a, H> {
    handle: &'a mut H,
    state: State,
    results: Vec<PqResult>,
}

impl<'a, H: ProtocolHandle> ExecFlow<'a, H> {
    /// Create a flow over a handle with a query already queued.
    pub fn new(handle: &'a mut H) -> Self {
        Self {
            handle,
            state: State::Flush,
            results: Vec::new(),
        }
    }
}

impl<H: ProtocolHandle> Flow for ExecFlow<'_, H> {
    type Output = Vec<PqResult>;

    fn resume(&mut self, ready: Option<Ready>) -> Result<Step<Vec<PqResult>>> {
        if self.state == State::Finished {
            return Err(Error::Internal("query flow resumed after completion".into()));
        }

        if self.state == State::Flush {
            // The server may send data (notices, notifications) while we
            // are still writing; leaving it unread would stall the socket.
            if ready == Some(Ready::Read) {
                self.handle.consume_input()?;
            }
            if self.handle.flush()? > 0 {
                return Ok(Step::Wait(self.handle.socket(), Wait::ReadWrite));
            }
            self.state = State::Collect;
        }

        loop {
            self.handle.consume_input()?;
            if self.handle.is_busy() {
                return Ok(Step::Wait(self.handle.socket(), Wait::Read));
            }
            match self.handle.get_result() {
                None => {
                    self.state = State::Finished;
                    return Ok(Step::Done(std::mem::take(&mut self.results)));
                }
                Some(result) => {
                    let copy = result.status.is_copy();
                    self.results.push(result);
                    if copy {
                        // In COPY mode the native library synthesizes a
                        // result for every request; collecting further
                        // results would loop forever.
                        self.state = State::Finished;
                        return Ok(Step::Done(std::mem::take(&mut self.results)));
                    }
                }
            }
        }
    }
}
