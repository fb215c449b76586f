//! Session state shared by the synchronous and asynchronous facades.
//!
//! A [`Session`] owns the protocol handle, the savepoint stack, and the
//! encoding cache, and carries the guard logic and scope-planning rules
//! that both connection flavors apply under their respective locks. It
//! performs no I/O itself.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::encoding::{Codec, codec_for};
use crate::error::{Error, Result, ScopeId};
use crate::pq::{Notify, PqResult, ProtocolHandle, TransactionStatus};

pub(crate) const MSG_AUTOCOMMIT_IN_TX: &str =
    "can't change autocommit state when in Transaction context";
pub(crate) const MSG_COMMIT_IN_TX: &str = "Explicit commit() forbidden within a Transaction \
     context. (Transaction will be automatically committed on successful exit from context.)";
pub(crate) const MSG_ROLLBACK_IN_TX: &str = "Explicit rollback() forbidden within a Transaction \
     context. (Either raise Transaction.Rollback() or allow an exception to propagate out of the \
     context.)";
pub(crate) const MSG_CLOSED: &str = "the connection is closed";
pub(crate) const MSG_BROKEN: &str = "the connection is broken";

static SCOPE_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_scope_id() -> ScopeId {
    ScopeId(SCOPE_IDS.fetch_add(1, Ordering::Relaxed))
}

/// One entry of the savepoint stack.
///
/// The stack mirrors the server's transaction nesting: `Outer` is the frame
/// that issued `BEGIN` (always at the bottom, at most once), every other
/// entry is a named savepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SavepointEntry {
    Outer,
    Named(String),
}

/// What a transaction scope did on entry, so its exit can undo exactly that.
#[derive(Debug, Clone)]
pub(crate) struct ScopeRecord {
    pub(crate) id: ScopeId,
    pub(crate) is_outer: bool,
    pub(crate) savepoint: Option<String>,
    pub(crate) prior_autocommit: bool,
}

/// Mutable session state, guarded by the connection lock.
pub(crate) struct Session<H> {
    handle: Option<H>,
    savepoints: Vec<SavepointEntry>,
    pgenc: Option<String>,
    codec: Codec,
    broken: bool,
}

impl<H: ProtocolHandle> Session<H> {
    pub(crate) fn new(handle: H) -> Self {
        Self {
            handle: Some(handle),
            savepoints: Vec::new(),
            pgenc: None,
            codec: Codec::Ascii,
            broken: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Drop the handle, finalizing the native connection.
    pub(crate) fn close(&mut self) {
        self.handle = None;
    }

    pub(crate) fn handle_mut(&mut self) -> Result<&mut H> {
        if self.broken {
            return Err(Error::Operational(MSG_BROKEN.into()));
        }
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Operational(MSG_CLOSED.into()))
    }

    /// Borrow the handle together with the broken flag, so an in-flight
    /// command can poison the session if it is abandoned mid-way.
    pub(crate) fn exec_parts(&mut self) -> Result<(&mut H, &mut bool)> {
        if self.broken {
            return Err(Error::Operational(MSG_BROKEN.into()));
        }
        let Session { handle, broken, .. } = self;
        match handle {
            Some(h) => Ok((h, broken)),
            None => Err(Error::Operational(MSG_CLOSED.into())),
        }
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        match &self.handle {
            Some(h) if !self.broken => h.transaction_status(),
            _ => TransactionStatus::Unknown,
        }
    }

    /// True while any transaction scope is active on this session.
    pub(crate) fn scope_active(&self) -> bool {
        !self.savepoints.is_empty()
    }

    fn named_count(&self) -> usize {
        self.savepoints
            .iter()
            .filter(|e| matches!(e, SavepointEntry::Named(_)))
            .count()
    }

    /// Decide whether a new scope is the outer frame and which savepoint
    /// name (if any) it must create.
    pub(crate) fn scope_entry_shape(
        &self,
        requested: Option<String>,
    ) -> Result<(bool, Option<String>)> {
        if let Some(name) = &requested {
            validate_savepoint_name(name)?;
        }
        match self.transaction_status() {
            TransactionStatus::Idle => {
                debug_assert!(self.savepoints.is_empty(), "savepoint stack out of sync");
                Ok((true, requested))
            }
            TransactionStatus::InTrans | TransactionStatus::InError => {
                let name = requested
                    .unwrap_or_else(|| format!("tx_savepoint_{}", self.named_count() + 1));
                Ok((false, Some(name)))
            }
            TransactionStatus::Unknown => Err(Error::Operational(MSG_CLOSED.into())),
            TransactionStatus::Active => Err(Error::Internal(
                "transaction status Active while the connection lock is held".into(),
            )),
        }
    }

    pub(crate) fn record_entered(&mut self, is_outer: bool, savepoint: Option<&str>) {
        if is_outer {
            self.savepoints.push(SavepointEntry::Outer);
        }
        if let Some(name) = savepoint {
            self.savepoints.push(SavepointEntry::Named(name.to_owned()));
        }
    }

    pub(crate) fn pop_named(&mut self, name: &str) {
        let top = self.savepoints.pop();
        debug_assert!(
            matches!(&top, Some(SavepointEntry::Named(n)) if n == name),
            "savepoint stack out of sync"
        );
    }

    pub(crate) fn pop_outer(&mut self) {
        let top = self.savepoints.pop();
        debug_assert!(
            matches!(&top, Some(SavepointEntry::Outer)),
            "savepoint stack out of sync"
        );
    }

    /// Pop every notification queued on the handle.
    pub(crate) fn drain_notifies(&mut self) -> Vec<Notify> {
        let mut notifies = Vec::new();
        if let Ok(handle) = self.handle_mut() {
            while let Some(notify) = handle.next_notify() {
                notifies.push(notify);
            }
        }
        notifies
    }

    /// The session codec, refreshed against the current `client_encoding`
    /// parameter. Any command may change the parameter, so the cache keys
    /// on the server-reported name.
    pub(crate) fn codec(&mut self) -> Result<Codec> {
        let current = {
            let handle = self.handle_mut()?;
            handle
                .parameter_status("client_encoding")
                .unwrap_or_default()
        };
        if self.pgenc.as_deref() != Some(current.as_str()) {
            self.codec = codec_for(&current)?;
            self.pgenc = Some(current);
        }
        Ok(self.codec)
    }
}

/// Recover from a poisoned lock; session state stays consistent because
/// every mutation completes before the guard is released.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Require a single successful result for a driver command.
pub(crate) fn check_command_result(command: &str, results: &[PqResult]) -> Result<()> {
    let result = match results {
        [result] => result,
        _ => {
            return Err(Error::Internal(format!(
                "expected a single result for {command}, got {}",
                results.len()
            )));
        }
    };
    if result.status.is_ok() {
        Ok(())
    } else {
        Err(Error::Operational(format!(
            "error on {command}: {}",
            result.error_message()
        )))
    }
}

/// Guard for changing the autocommit policy: forbidden inside a transaction
/// scope and whenever the session is not idle.
pub(crate) fn check_autocommit_change<H: ProtocolHandle>(session: &Session<H>) -> Result<()> {
    if session.scope_active() {
        return Err(Error::Programming(MSG_AUTOCOMMIT_IN_TX.into()));
    }
    let status = session.transaction_status();
    if status != TransactionStatus::Idle {
        return Err(Error::Programming(format!(
            "couldn't change autocommit state: connection in transaction status {status:?}"
        )));
    }
    Ok(())
}

/// Savepoint names travel unquoted in SQL, so only plain ASCII identifiers
/// are accepted.
pub(crate) fn validate_savepoint_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::Programming(format!(
            "invalid savepoint name: {name:?}"
        )))
    }
}

/// Token identifying a registered notice or notify listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

pub(crate) type ListenerFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered listener list. Duplicate registrations are permitted; removal is
/// by token.
pub(crate) struct Listeners<T> {
    next_id: u64,
    items: Vec<(u64, ListenerFn<T>)>,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            items: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, listener: ListenerFn<T>) -> ListenerToken {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push((id, listener));
        ListenerToken(id)
    }

    pub(crate) fn remove(&mut self, token: ListenerToken) -> Result<()> {
        match self.items.iter().position(|(id, _)| *id == token.0) {
            Some(i) => {
                self.items.remove(i);
                Ok(())
            }
            None => Err(Error::Programming("listener is not registered".into())),
        }
    }

    /// Snapshot for dispatch, so listeners may register or remove listeners
    /// from within a callback.
    pub(crate) fn snapshot(&self) -> Vec<ListenerFn<T>> {
        self.items.iter().map(|(_, f)| Arc::clone(f)).collect()
    }
}

/// Call each listener in registration order. A panicking listener is logged
/// and skipped; it never affects the connection.
pub(crate) fn dispatch<T>(listeners: &[ListenerFn<T>], value: &T, what: &str) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            tracing::error!("{what} listener panicked, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pq::{ConnStatus, Notice, Notify, PollingStatus, PqResult};
    use std::os::unix::io::RawFd;

    struct NullHandle {
        status: TransactionStatus,
    }

    impl ProtocolHandle for NullHandle {
        fn start_connect(_conninfo: &str) -> Result<Self> {
            Ok(Self {
                status: TransactionStatus::Idle,
            })
        }
        fn status(&self) -> ConnStatus {
            ConnStatus::Ok
        }
        fn connect_poll(&mut self) -> PollingStatus {
            PollingStatus::Ok
        }
        fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<()> {
            Ok(())
        }
        fn socket(&self) -> RawFd {
            -1
        }
        fn send_query(&mut self, _query: &[u8]) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) -> Result<usize> {
            Ok(0)
        }
        fn consume_input(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_busy(&mut self) -> bool {
            false
        }
        fn get_result(&mut self) -> Option<PqResult> {
            None
        }
        fn transaction_status(&self) -> TransactionStatus {
            self.status
        }
        fn parameter_status(&self, _name: &str) -> Option<String> {
            Some("UTF8".to_owned())
        }
        fn escape_literal(&self, value: &str) -> Result<String> {
            Ok(format!("'{value}'"))
        }
        fn next_notify(&mut self) -> Option<Notify> {
            None
        }
        fn set_notice_handler(&mut self, _handler: Box<dyn FnMut(Notice) + Send>) {}
        fn error_message(&self) -> String {
            String::new()
        }
    }

    fn session(status: TransactionStatus) -> Session<NullHandle> {
        Session::new(NullHandle { status })
    }

    #[test]
    fn outer_frame_at_idle() {
        let s = session(TransactionStatus::Idle);
        assert_eq!(s.scope_entry_shape(None).unwrap(), (true, None));
        assert_eq!(
            s.scope_entry_shape(Some("foo".into())).unwrap(),
            (true, Some("foo".into()))
        );
    }

    #[test]
    fn inner_frame_synthesizes_names() {
        let mut s = session(TransactionStatus::InTrans);
        s.record_entered(true, None);
        assert_eq!(
            s.scope_entry_shape(None).unwrap(),
            (false, Some("tx_savepoint_1".into()))
        );
        s.record_entered(false, Some("tx_savepoint_1"));
        assert_eq!(
            s.scope_entry_shape(None).unwrap(),
            (false, Some("tx_savepoint_2".into()))
        );
    }

    #[test]
    fn name_synthesis_counts_only_named_entries() {
        let mut s = session(TransactionStatus::InTrans);
        s.record_entered(true, Some("foo"));
        assert_eq!(
            s.scope_entry_shape(None).unwrap(),
            (false, Some("tx_savepoint_2".into()))
        );
    }

    #[test]
    fn pops_restore_empty_stack() {
        let mut s = session(TransactionStatus::InTrans);
        s.record_entered(true, Some("foo"));
        assert!(s.scope_active());
        s.pop_named("foo");
        s.pop_outer();
        assert!(!s.scope_active());
    }

    #[test]
    fn savepoint_names_are_validated() {
        assert!(validate_savepoint_name("sp_1").is_ok());
        assert!(validate_savepoint_name("_x").is_ok());
        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1up").is_err());
        assert!(validate_savepoint_name("sp; drop").is_err());
        assert!(validate_savepoint_name("caf\u{e9}").is_err());
    }

    #[test]
    fn closed_session_reports_unknown_status() {
        let mut s = session(TransactionStatus::Idle);
        s.close();
        assert_eq!(s.transaction_status(), TransactionStatus::Unknown);
        assert!(matches!(
            s.scope_entry_shape(None),
            Err(Error::Operational(_))
        ));
    }

    #[test]
    fn listener_tokens_are_single_use() {
        let mut listeners: Listeners<Notice> = Listeners::new();
        let token = listeners.add(Arc::new(|_| {}));
        assert!(listeners.remove(token).is_ok());
        assert!(listeners.remove(token).is_err());
    }

    #[test]
    fn dispatch_survives_panicking_listener() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let mut listeners: Listeners<Notice> = Listeners::new();
        listeners.add(Arc::new(|_| panic!("bad listener")));
        let counter = Arc::clone(&calls);
        listeners.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let notice = Notice {
            severity: "NOTICE".into(),
            code: String::new(),
            message: "hello".into(),
        };
        dispatch(&listeners.snapshot(), &notice, "notice");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
