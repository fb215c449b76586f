//! Connection setup flow.

use crate::error::{Error, Result};
use crate::pq::{ConnStatus, PollingStatus, ProtocolHandle};

use super::{Flow, Ready, Step, Wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Polling,
    Finished,
}

/// Flow that establishes a connection without blocking.
///
/// Starts an asynchronous connect on first resume, then polls the handshake,
/// yielding read or write waits as the native library requests them. On
/// completion the handle is switched to nonblocking mode and returned.
pub struct ConnectFlow<H> {
    conninfo: String,
    handle: Option<H>,
    state: State,
}

impl<H: ProtocolHandle> ConnectFlow<H> {
    /// Create a flow that will connect with the given conninfo string.
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
            handle: None,
            state: State::Start,
        }
    }
}

impl<H: ProtocolHandle> Flow for ConnectFlow<H> {
    type Output = H;

    fn resume(&mut self, _ready: Option<Ready>) -> Result<Step<H>> {
        if self.state == State::Start {
            self.handle = Some(H::start_connect(&self.conninfo)?);
            self.state = State::Polling;
        }

        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::Internal("connect flow resumed after completion".into()))?;

        if handle.status() == ConnStatus::Bad {
            return Err(Error::Operational(format!(
                "connection is bad: {}",
                handle.error_message()
            )));
        }

        match handle.connect_poll() {
            PollingStatus::Ok => {
                handle.set_nonblocking(true)?;
                self.state = State::Finished;
                let handle = self
                    .handle
                    .take()
                    .ok_or_else(|| Error::Internal("connect flow lost its handle".into()))?;
                Ok(Step::Done(handle))
            }
            PollingStatus::Reading => Ok(Step::Wait(handle.socket(), Wait::Read)),
            PollingStatus::Writing => Ok(Step::Wait(handle.socket(), Wait::Write)),
            PollingStatus::Failed => Err(Error::Operational(format!(
                "connection failed: {}",
                handle.error_message()
            ))),
            PollingStatus::Active => {
                Err(Error::Internal("unexpected connect poll status".into()))
            }
        }
    }
}
