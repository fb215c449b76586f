//! Scripted in-memory protocol handle used to drive the crate in tests.
//!
//! The fake models just enough server behavior for the facade and scope
//! semantics: transaction status transitions, savepoint frames over a
//! single-column table, notices, and notifications. A `FakeProbe` shares
//! the state so tests can assert on the exact command log and on row
//! visibility from "another connection" (the durable set).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pqlink::pq::{
    ConnStatus, ExecStatus, Notice, Notify, PollingStatus, PqResult, ProtocolHandle,
    TransactionStatus,
};
use pqlink::{Error, Result};

pub const BACKEND_PID: u32 = 4242;

const KNOWN_ENCODINGS: &[&str] = &["UTF8", "LATIN1", "LATIN2", "EUC_JP", "EUC_TW", "SQL_ASCII"];

#[derive(Default)]
struct Frame {
    savepoint: Option<String>,
    rows: Vec<String>,
}

#[derive(Default)]
pub struct FakeState {
    log: Vec<String>,
    durable: Vec<String>,
    frames: Vec<Frame>,
    status: TransactionStatus,
    pending: VecDeque<PqResult>,
    flush_chunks: usize,
    notices: VecDeque<Notice>,
    notifies: VecDeque<Notify>,
    client_encoding: Option<String>,
    fail_contains: Option<String>,
    busy_polls: usize,
}

impl FakeState {
    fn error_result(&mut self, message: &str) -> PqResult {
        if !self.frames.is_empty() {
            self.status = TransactionStatus::InError;
        }
        PqResult {
            status: ExecStatus::FatalError,
            command_tag: None,
            rows: Vec::new(),
            error_message: Some(message.to_owned()),
        }
    }

    fn visible_rows(&self) -> Vec<String> {
        let mut rows = self.durable.clone();
        for frame in &self.frames {
            rows.extend(frame.rows.iter().cloned());
        }
        rows
    }

    fn run_command(&mut self, sql: &str) -> PqResult {
        let sql = sql.trim();

        if let Some(pattern) = self.fail_contains.clone() {
            if sql.contains(pattern.as_str()) {
                return self.error_result(&format!("scripted failure on {sql}"));
            }
        }

        // An aborted transaction rejects everything except a rollback or a
        // transaction close.
        if self.status == TransactionStatus::InError
            && !sql.starts_with("ROLLBACK")
            && sql != "COMMIT"
        {
            return self.error_result(
                "current transaction is aborted, commands ignored until end of transaction block",
            );
        }

        if sql == "BEGIN" {
            self.frames.push(Frame::default());
            self.status = TransactionStatus::InTrans;
            PqResult::command_ok()
        } else if sql == "COMMIT" {
            if self.status != TransactionStatus::InError {
                let committed = self.visible_rows();
                self.durable = committed;
            }
            self.frames.clear();
            self.status = TransactionStatus::Idle;
            PqResult::command_ok()
        } else if sql == "ROLLBACK" {
            self.frames.clear();
            self.status = TransactionStatus::Idle;
            PqResult::command_ok()
        } else if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            if self.frames.is_empty() {
                return self.error_result("SAVEPOINT can only be used in transaction blocks");
            }
            self.frames.push(Frame {
                savepoint: Some(name.to_owned()),
                rows: Vec::new(),
            });
            PqResult::command_ok()
        } else if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            let Some(at) = self
                .frames
                .iter()
                .rposition(|f| f.savepoint.as_deref() == Some(name))
            else {
                return self.error_result(&format!("savepoint \"{name}\" does not exist"));
            };
            let merged: Vec<String> = self
                .frames
                .drain(at..)
                .flat_map(|frame| frame.rows)
                .collect();
            if let Some(below) = self.frames.last_mut() {
                below.rows.extend(merged);
            } else {
                self.durable.extend(merged);
            }
            PqResult::command_ok()
        } else if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            let Some(at) = self
                .frames
                .iter()
                .rposition(|f| f.savepoint.as_deref() == Some(name))
            else {
                return self.error_result(&format!("savepoint \"{name}\" does not exist"));
            };
            self.frames.truncate(at + 1);
            if let Some(frame) = self.frames.get_mut(at) {
                frame.rows.clear();
            }
            self.status = TransactionStatus::InTrans;
            PqResult::command_ok()
        } else if sql.starts_with("INSERT") {
            let Some(value) = quoted_value(sql) else {
                return self.error_result("syntax error in INSERT");
            };
            match self.frames.last_mut() {
                Some(frame) => frame.rows.push(value),
                None => self.durable.push(value),
            }
            PqResult {
                status: ExecStatus::CommandOk,
                command_tag: Some("INSERT 0 1".to_owned()),
                rows: Vec::new(),
                error_message: None,
            }
        } else if sql.starts_with("SELECT") {
            let rows = self
                .visible_rows()
                .into_iter()
                .map(|row| vec![Some(row.into_bytes())])
                .collect();
            PqResult {
                status: ExecStatus::TuplesOk,
                command_tag: Some("SELECT".to_owned()),
                rows,
                error_message: None,
            }
        } else if let Some(rest) = sql.strip_prefix("SET client_encoding TO ") {
            let value = quoted_value(rest)
                .unwrap_or_else(|| rest.trim().to_owned())
                .to_ascii_uppercase();
            if !KNOWN_ENCODINGS.contains(&value.as_str()) {
                return self.error_result(&format!("invalid value for parameter \"client_encoding\": \"{value}\""));
            }
            self.client_encoding = Some(value);
            PqResult::command_ok()
        } else if sql.starts_with("COPY") {
            PqResult {
                status: ExecStatus::CopyIn,
                command_tag: None,
                rows: Vec::new(),
                error_message: None,
            }
        } else if sql.starts_with("LISTEN") {
            PqResult::command_ok()
        } else if let Some(rest) = sql.strip_prefix("NOTIFY ") {
            let channel = rest.split(',').next().unwrap_or("").trim().to_owned();
            let payload = quoted_value(rest).unwrap_or_default();
            self.notifies.push_back(Notify {
                pid: BACKEND_PID,
                channel,
                payload,
            });
            PqResult::command_ok()
        } else if let Some(rest) = sql.strip_prefix("RAISE NOTICE ") {
            self.notices.push_back(Notice {
                severity: "NOTICE".to_owned(),
                code: "00000".to_owned(),
                message: quoted_value(rest).unwrap_or_default(),
            });
            PqResult::command_ok()
        } else {
            self.error_result(&format!("syntax error at or near \"{sql}\""))
        }
    }
}

fn quoted_value(sql: &str) -> Option<String> {
    let start = sql.find('\'')?;
    let rest = &sql[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_owned())
}

fn lock(state: &Arc<Mutex<FakeState>>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared view of the fake server, for assertions from tests.
pub struct FakeProbe {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProbe {
    /// Every command sent so far, in order.
    pub fn log(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// Rows visible to this session, including uncommitted ones.
    pub fn session_rows(&self) -> Vec<String> {
        lock(&self.state).visible_rows()
    }

    /// Rows visible to an outside observer on another connection.
    pub fn committed_rows(&self) -> Vec<String> {
        lock(&self.state).durable.clone()
    }

    pub fn status(&self) -> TransactionStatus {
        lock(&self.state).status
    }

    /// Fail any subsequent command containing the given text.
    pub fn fail_commands_containing(&self, pattern: &str) {
        lock(&self.state).fail_contains = Some(pattern.to_owned());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).fail_contains = None;
    }

    /// Make the next command report pending write bytes this many times
    /// before the flush drains.
    pub fn set_flush_chunks(&self, chunks: usize) {
        lock(&self.state).flush_chunks = chunks;
    }

    /// Make the handle report busy this many times before yielding results.
    pub fn set_busy_polls(&self, polls: usize) {
        lock(&self.state).busy_polls = polls;
    }
}

/// Scripted protocol handle over shared fake state.
pub struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
    sock: UnixStream,
    _peer: UnixStream,
    poll_script: VecDeque<PollingStatus>,
    conn_status: ConnStatus,
    nonblocking: bool,
    notice_handler: Option<Box<dyn FnMut(Notice) + Send>>,
}

/// A connected handle plus the probe observing it.
pub fn fake_pair() -> (FakeHandle, FakeProbe) {
    let state = Arc::new(Mutex::new(FakeState::default()));
    let handle = FakeHandle::with_state(Arc::clone(&state), true);
    (handle, FakeProbe { state })
}

/// Like [`fake_pair`], but the socket never becomes readable, so a flow
/// that waits for read readiness blocks until cancelled.
pub fn fake_pair_unprimed() -> (FakeHandle, FakeProbe) {
    let state = Arc::new(Mutex::new(FakeState::default()));
    let handle = FakeHandle::with_state(Arc::clone(&state), false);
    (handle, FakeProbe { state })
}

impl FakeHandle {
    fn with_state(state: Arc<Mutex<FakeState>>, primed: bool) -> Self {
        let (sock, mut peer) = UnixStream::pair().expect("socketpair");
        if primed {
            // Keep the descriptor permanently readable so readiness waits
            // return immediately.
            peer.write_all(b"x").expect("prime socket");
        }
        Self {
            state,
            sock,
            _peer: peer,
            poll_script: VecDeque::new(),
            conn_status: ConnStatus::Ok,
            nonblocking: false,
            notice_handler: None,
        }
    }
}

impl ProtocolHandle for FakeHandle {
    /// The conninfo string scripts the handshake: `handshake=rw` yields a
    /// read wait and a write wait before completing, `handshake=fail`
    /// fails the poll, `handshake=error` refuses to start.
    fn start_connect(conninfo: &str) -> Result<Self> {
        if conninfo.contains("handshake=error") {
            return Err(Error::Operational("could not start connection".into()));
        }
        let mut handle = Self::with_state(Arc::new(Mutex::new(FakeState::default())), true);
        if conninfo.contains("handshake=rw") {
            handle.poll_script =
                VecDeque::from([PollingStatus::Reading, PollingStatus::Writing]);
        } else if conninfo.contains("handshake=fail") {
            handle.poll_script = VecDeque::from([PollingStatus::Failed]);
        }
        Ok(handle)
    }

    fn status(&self) -> ConnStatus {
        self.conn_status
    }

    fn connect_poll(&mut self) -> PollingStatus {
        self.poll_script.pop_front().unwrap_or(PollingStatus::Ok)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        self.nonblocking = nonblocking;
        Ok(())
    }

    fn socket(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn send_query(&mut self, query: &[u8]) -> Result<()> {
        let sql = String::from_utf8_lossy(query).into_owned();
        let mut state = lock(&self.state);
        state.log.push(sql.clone());
        let result = state.run_command(&sql);
        let copy = result.status.is_copy();
        state.pending.push_back(result);
        if copy {
            // The native library synthesizes phony results while a COPY is
            // in progress; model one so the flow's early return is visible.
            state.pending.push_back(PqResult::command_ok());
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        let mut state = lock(&self.state);
        if state.flush_chunks > 0 {
            state.flush_chunks -= 1;
            Ok(64)
        } else {
            Ok(0)
        }
    }

    fn consume_input(&mut self) -> Result<()> {
        let notices: Vec<Notice> = {
            let mut state = lock(&self.state);
            state.notices.drain(..).collect()
        };
        if let Some(handler) = &mut self.notice_handler {
            for notice in notices {
                handler(notice);
            }
        }
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        let mut state = lock(&self.state);
        if state.busy_polls > 0 {
            state.busy_polls -= 1;
            true
        } else {
            false
        }
    }

    fn get_result(&mut self) -> Option<PqResult> {
        lock(&self.state).pending.pop_front()
    }

    fn transaction_status(&self) -> TransactionStatus {
        lock(&self.state).status
    }

    fn parameter_status(&self, name: &str) -> Option<String> {
        if name == "client_encoding" {
            let state = lock(&self.state);
            Some(
                state
                    .client_encoding
                    .clone()
                    .unwrap_or_else(|| "UTF8".to_owned()),
            )
        } else {
            None
        }
    }

    fn escape_literal(&self, value: &str) -> Result<String> {
        Ok(format!("'{}'", value.replace('\'', "''")))
    }

    fn next_notify(&mut self) -> Option<Notify> {
        lock(&self.state).notifies.pop_front()
    }

    fn set_notice_handler(&mut self, handler: Box<dyn FnMut(Notice) + Send>) {
        self.notice_handler = Some(handler);
    }

    fn error_message(&self) -> String {
        "server closed the connection unexpectedly".to_owned()
    }
}
