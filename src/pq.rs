//! The protocol handle seam.
//!
//! pqlink does not speak the PostgreSQL wire protocol itself. Everything in
//! this crate is generic over [`ProtocolHandle`], a thin adapter over a
//! native protocol client in the shape of libpq's nonblocking API: start a
//! connect, poll the handshake, send a query, flush, consume input, fetch
//! results. The test suite drives the crate with a scripted in-memory
//! handle; production use plugs in a binding over a real client library.

use std::os::unix::io::RawFd;

use crate::error::Result;

/// Connection status reported by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnStatus {
    /// Connection is usable.
    #[default]
    Ok,
    /// Connection is broken or was never established.
    Bad,
}

/// Result of polling a connect handshake in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Handshake complete.
    Ok,
    /// Wait for the socket to become readable, then poll again.
    Reading,
    /// Wait for the socket to become writable, then poll again.
    Writing,
    /// Handshake failed.
    Failed,
    /// Reserved by the native library; never expected here.
    Active,
}

/// Server transaction status, as reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    #[default]
    Idle,
    /// A command is currently in progress.
    Active,
    /// In a transaction block.
    InTrans,
    /// In a failed transaction block; commands are rejected until rollback.
    InError,
    /// Status cannot be determined (connection closed or broken).
    Unknown,
}

/// Status of a single command result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The query string was empty.
    EmptyQuery,
    /// A command that returns no rows completed successfully.
    CommandOk,
    /// A command that returns rows completed successfully.
    TuplesOk,
    /// Copy-out transfer started.
    CopyOut,
    /// Copy-in transfer started.
    CopyIn,
    /// Copy-both transfer started.
    CopyBoth,
    /// The server response was not understood.
    BadResponse,
    /// Non-fatal server error (notice).
    NonfatalError,
    /// Server error; the command failed.
    FatalError,
}

impl ExecStatus {
    /// Returns true for the statuses of a successfully completed command.
    pub fn is_ok(self) -> bool {
        matches!(self, ExecStatus::CommandOk | ExecStatus::TuplesOk)
    }

    /// Returns true for any COPY mode status.
    pub fn is_copy(self) -> bool {
        matches!(
            self,
            ExecStatus::CopyIn | ExecStatus::CopyOut | ExecStatus::CopyBoth
        )
    }
}

/// One result of a command, as produced by [`ProtocolHandle::get_result`].
///
/// Rows are text-format cells; `None` marks SQL NULL.
#[derive(Debug, Clone)]
pub struct PqResult {
    /// Result status.
    pub status: ExecStatus,
    /// Command tag, e.g. `INSERT 0 1`.
    pub command_tag: Option<String>,
    /// Data rows for row-returning commands.
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    /// Primary error message for error statuses.
    pub error_message: Option<String>,
}

impl PqResult {
    /// Build a `CommandOk` result with no rows.
    pub fn command_ok() -> Self {
        Self {
            status: ExecStatus::CommandOk,
            command_tag: None,
            rows: Vec::new(),
            error_message: None,
        }
    }

    /// The error message, or an empty string.
    pub fn error_message(&self) -> &str {
        self.error_message.as_deref().unwrap_or_default()
    }
}

/// Asynchronous notification delivered by LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// PID of the notifying backend process.
    pub pid: u32,
    /// Channel name.
    pub channel: String,
    /// Notification payload.
    pub payload: String,
}

/// Non-fatal notice or warning from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity: NOTICE, WARNING, DEBUG, INFO, LOG.
    pub severity: String,
    /// SQLSTATE code, when the server provided one.
    pub code: String,
    /// Primary message.
    pub message: String,
}

/// Thin adapter over a native nonblocking protocol client.
///
/// All methods are expected to be nonblocking once
/// [`set_nonblocking`](ProtocolHandle::set_nonblocking) has been applied;
/// the I/O engine in [`crate::state`] yields readiness requests whenever an
/// operation would block.
pub trait ProtocolHandle: Send + Sized {
    /// Start an asynchronous connect for the given conninfo string.
    fn start_connect(conninfo: &str) -> Result<Self>;

    /// Current connection status.
    fn status(&self) -> ConnStatus;

    /// Poll the connect handshake.
    fn connect_poll(&mut self) -> PollingStatus;

    /// Switch the underlying socket between blocking and nonblocking mode.
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()>;

    /// The socket descriptor to wait on.
    fn socket(&self) -> RawFd;

    /// Queue a query for sending.
    fn send_query(&mut self, query: &[u8]) -> Result<()>;

    /// Flush pending writes. Returns the number of bytes still queued;
    /// zero means the write buffer is drained.
    fn flush(&mut self) -> Result<usize>;

    /// Consume input available on the socket.
    fn consume_input(&mut self) -> Result<()>;

    /// Returns true if [`get_result`](ProtocolHandle::get_result) would
    /// block waiting for more input.
    fn is_busy(&mut self) -> bool;

    /// Fetch the next result of the current command, or `None` when the
    /// command's result batch is exhausted.
    fn get_result(&mut self) -> Option<PqResult>;

    /// Server transaction status.
    fn transaction_status(&self) -> TransactionStatus;

    /// Read a server parameter such as `client_encoding`.
    fn parameter_status(&self, name: &str) -> Option<String>;

    /// Escape a string as a quoted SQL literal.
    fn escape_literal(&self, value: &str) -> Result<String>;

    /// Pop the next pending asynchronous notification, if any.
    fn next_notify(&mut self) -> Option<Notify>;

    /// Install the callback invoked for incoming server notices.
    fn set_notice_handler(&mut self, handler: Box<dyn FnMut(Notice) + Send>);

    /// Last error message reported by the native library.
    fn error_message(&self) -> String;
}
