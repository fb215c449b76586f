//! Asynchronous connection facade.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::conninfo::make_conninfo;
use crate::encoding::Codec;
use crate::error::{Error, Result};
use crate::opts::{ConnectOptions, TransactionOptions};
use crate::pq::{
    ConnStatus, ExecStatus, Notice, Notify, PqResult, ProtocolHandle, TransactionStatus,
};
use crate::session::{
    self, ListenerToken, Listeners, MSG_CLOSED, MSG_COMMIT_IN_TX, MSG_ROLLBACK_IN_TX, Session,
    check_command_result, dispatch, lock,
};
use crate::state::{ConnectFlow, ExecFlow};

use super::transaction::{self, Transaction};
use super::wait;

pub(crate) struct Inner<H> {
    pub(crate) session: Mutex<Session<H>>,
    pub(crate) closed: AtomicBool,
    pub(crate) autocommit: AtomicBool,
    pub(crate) notice_listeners: Arc<StdMutex<Listeners<Notice>>>,
    pub(crate) notify_listeners: StdMutex<Listeners<Notify>>,
}

/// Asynchronous connection.
///
/// Cheap to clone; all clones share one protocol handle and serialize their
/// commands through one cooperative lock. At most one command is in flight
/// at any time. Not for use across runtime threads beyond what the lock
/// serializes: suspension points are the socket waits and the lock itself.
pub struct Conn<H: ProtocolHandle> {
    pub(crate) inner: Arc<Inner<H>>,
}

impl<H: ProtocolHandle> Clone for Conn<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ProtocolHandle> Conn<H> {
    /// Connect to the server.
    ///
    /// `conninfo` may be a keyword string or a `postgres://` URL; keyword
    /// overrides from `options` are merged into it. The `autocommit` option
    /// is consumed by the driver and not forwarded.
    pub async fn connect(conninfo: &str, options: ConnectOptions) -> Result<Self> {
        let conninfo = make_conninfo(conninfo, &options.overrides)?;
        let handle = wait::drive(ConnectFlow::new(conninfo)).await?;
        Ok(Self::from_handle(handle, options))
    }

    /// Adopt an already-established protocol handle.
    pub fn from_handle(mut handle: H, options: ConnectOptions) -> Self {
        let notice_listeners = Arc::new(StdMutex::new(Listeners::new()));
        let hook = Arc::clone(&notice_listeners);
        handle.set_notice_handler(Box::new(move |notice| {
            let snapshot = { lock(&hook).snapshot() };
            dispatch(&snapshot, &notice, "notice");
        }));
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session::new(handle)),
                closed: AtomicBool::new(false),
                autocommit: AtomicBool::new(options.autocommit),
                notice_listeners,
                notify_listeners: StdMutex::new(Listeners::new()),
            }),
        }
    }

    /// Execute a user command, returning all its results.
    ///
    /// When autocommit is off and the session is idle, an implicit `BEGIN`
    /// is issued first. Server-reported errors surface as
    /// [`Error::Database`]. Cancelling the returned future mid-command
    /// leaves the wire state indeterminate and poisons the connection.
    pub async fn execute(&self, query: &str) -> Result<Vec<PqResult>> {
        let (result, notifies) = {
            let mut session = self.inner.session.lock().await;
            let result = self.execute_locked(&mut session, query).await;
            let notifies = session.drain_notifies();
            (result, notifies)
        };
        self.dispatch_notifies(notifies);
        result
    }

    async fn execute_locked(
        &self,
        session: &mut Session<H>,
        query: &str,
    ) -> Result<Vec<PqResult>> {
        if !self.inner.autocommit.load(Ordering::SeqCst)
            && session.transaction_status() == TransactionStatus::Idle
        {
            exec_command_locked(session, "BEGIN").await?;
        }
        let (handle, broken) = session.exec_parts()?;
        let mut poison = PoisonGuard::new(broken);
        handle.send_query(query.as_bytes())?;
        let results = wait::drive(ExecFlow::new(handle)).await?;
        poison.disarm();
        for result in &results {
            if matches!(result.status, ExecStatus::FatalError | ExecStatus::BadResponse) {
                return Err(Error::Database(result.error_message().to_owned()));
            }
        }
        Ok(results)
    }

    /// Execute a driver command that must succeed with a single result.
    pub async fn execute_command(&self, command: &str) -> Result<()> {
        let (result, notifies) = {
            let mut session = self.inner.session.lock().await;
            let result = exec_command_locked(&mut session, command).await;
            let notifies = session.drain_notifies();
            (result, notifies)
        };
        self.dispatch_notifies(notifies);
        result
    }

    /// Commit the current transaction. A no-op when the session is idle.
    ///
    /// Forbidden while a transaction scope is active.
    pub async fn commit(&self) -> Result<()> {
        self.finish_transaction("COMMIT", MSG_COMMIT_IN_TX).await
    }

    /// Roll back the current transaction. A no-op when the session is idle.
    ///
    /// Forbidden while a transaction scope is active.
    pub async fn rollback(&self) -> Result<()> {
        self.finish_transaction("ROLLBACK", MSG_ROLLBACK_IN_TX).await
    }

    async fn finish_transaction(&self, command: &str, forbidden: &str) -> Result<()> {
        let (result, notifies) = {
            let mut session = self.inner.session.lock().await;
            if session.scope_active() {
                return Err(Error::Programming(forbidden.into()));
            }
            if session.is_closed() {
                return Err(Error::Operational(MSG_CLOSED.into()));
            }
            if session.transaction_status() == TransactionStatus::Idle {
                return Ok(());
            }
            let result = exec_command_locked(&mut session, command).await;
            let notifies = session.drain_notifies();
            (result, notifies)
        };
        self.dispatch_notifies(notifies);
        result
    }

    /// Whether commands run outside an implicit transaction.
    pub fn autocommit(&self) -> bool {
        self.inner.autocommit.load(Ordering::SeqCst)
    }

    /// Change the autocommit policy.
    ///
    /// Only permitted while the session is idle and no transaction scope is
    /// active.
    pub async fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        let session = self.inner.session.lock().await;
        session::check_autocommit_change(&session)?;
        self.inner.autocommit.store(autocommit, Ordering::SeqCst);
        Ok(())
    }

    /// The server-reported `client_encoding` name.
    pub async fn client_encoding(&self) -> Result<String> {
        let mut session = self.inner.session.lock().await;
        let handle = session.handle_mut()?;
        Ok(handle
            .parameter_status("client_encoding")
            .unwrap_or_default())
    }

    /// Change the session encoding with `SET client_encoding`.
    pub async fn set_client_encoding(&self, encoding: &str) -> Result<()> {
        let (result, notifies) = {
            let mut session = self.inner.session.lock().await;
            let result = match session
                .handle_mut()
                .and_then(|handle| handle.escape_literal(encoding))
            {
                Ok(literal) => {
                    exec_command_locked(
                        &mut session,
                        &format!("SET client_encoding TO {literal}"),
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            let notifies = session.drain_notifies();
            (result, notifies)
        };
        self.dispatch_notifies(notifies);
        result
    }

    /// The local codec resolved for the current session encoding.
    pub async fn codec(&self) -> Result<Codec> {
        self.inner.session.lock().await.codec()
    }

    /// Encode a string in the session encoding.
    pub async fn encode(&self, s: &str) -> Result<Vec<u8>> {
        self.codec().await?.encode(s)
    }

    /// Decode server bytes in the session encoding.
    pub async fn decode(&self, bytes: &[u8]) -> Result<String> {
        self.codec().await?.decode(bytes)
    }

    /// Register a listener for server notices.
    pub fn add_notice_listener(
        &self,
        listener: impl Fn(&Notice) + Send + Sync + 'static,
    ) -> ListenerToken {
        lock(&self.inner.notice_listeners).add(Arc::new(listener))
    }

    /// Remove a notice listener. Removing a token twice is an error.
    pub fn remove_notice_listener(&self, token: ListenerToken) -> Result<()> {
        lock(&self.inner.notice_listeners).remove(token)
    }

    /// Register a listener for asynchronous notifications.
    pub fn add_notify_listener(
        &self,
        listener: impl Fn(&Notify) + Send + Sync + 'static,
    ) -> ListenerToken {
        lock(&self.inner.notify_listeners).add(Arc::new(listener))
    }

    /// Remove a notify listener. Removing a token twice is an error.
    pub fn remove_notify_listener(&self, token: ListenerToken) -> Result<()> {
        lock(&self.inner.notify_listeners).remove(token)
    }

    fn dispatch_notifies(&self, notifies: Vec<Notify>) {
        if notifies.is_empty() {
            return;
        }
        let snapshot = lock(&self.inner.notify_listeners).snapshot();
        for notify in &notifies {
            dispatch(&snapshot, notify, "notification");
        }
    }

    /// Run a future inside a transaction scope with default options.
    ///
    /// See [`transaction_with`](Conn::transaction_with).
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(Transaction<H>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.transaction_with(TransactionOptions::default(), f).await
    }

    /// Run a future inside a transaction scope.
    ///
    /// On entry the scope issues `BEGIN` (outer frame) or `SAVEPOINT`
    /// (inner frame). When the future resolves to `Ok` the scope commits or
    /// releases its savepoint; on `Err` it rolls back. A
    /// [`Error::Rollback`] signal targeting this scope (or no scope in
    /// particular) rolls back and is swallowed, yielding `Ok(None)`.
    pub async fn transaction_with<T, F, Fut>(
        &self,
        options: TransactionOptions,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(Transaction<H>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let record = transaction::enter(self, &options).await?;
        let scope = Transaction::new(self, &record);
        let result = f(scope).await;
        transaction::finish(self, &record, options.force_rollback, result).await
    }

    /// Connection status as reported by the handle; `Bad` once closed.
    pub async fn status(&self) -> ConnStatus {
        let mut session = self.inner.session.lock().await;
        match session.handle_mut() {
            Ok(handle) => handle.status(),
            Err(_) => ConnStatus::Bad,
        }
    }

    /// Server transaction status; `Unknown` once closed.
    pub async fn transaction_status(&self) -> TransactionStatus {
        self.inner.session.lock().await.transaction_status()
    }

    /// Read a server parameter such as `server_version`.
    pub async fn server_parameter(&self, name: &str) -> Result<Option<String>> {
        let mut session = self.inner.session.lock().await;
        let handle = session.handle_mut()?;
        Ok(handle.parameter_status(name))
    }

    /// Close the connection, finalizing the handle. Idempotent.
    pub async fn close(&self) {
        let mut session = self.inner.session.lock().await;
        session.close();
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// True once [`close`](Conn::close) has been called.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Marks the session broken unless disarmed: a command future dropped at an
/// await point leaves the wire state indeterminate.
struct PoisonGuard<'a> {
    broken: &'a mut bool,
    armed: bool,
}

impl<'a> PoisonGuard<'a> {
    fn new(broken: &'a mut bool) -> Self {
        Self {
            broken,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.broken = true;
            tracing::warn!("command abandoned mid-flight, connection poisoned");
        }
    }
}

/// Send a driver command and require a single successful result.
pub(crate) async fn exec_command_locked<H: ProtocolHandle>(
    session: &mut Session<H>,
    command: &str,
) -> Result<()> {
    tracing::debug!("exec: {command}");
    let (handle, broken) = session.exec_parts()?;
    let mut poison = PoisonGuard::new(broken);
    handle.send_query(command.as_bytes())?;
    let results = wait::drive(ExecFlow::new(handle)).await?;
    poison.disarm();
    check_command_result(command, &results)
}
