//! Transaction scopes for the synchronous connection.

use std::sync::Weak;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result, ScopeId};
use crate::opts::TransactionOptions;
use crate::pq::ProtocolHandle;
use crate::session::{ScopeRecord, lock, next_scope_id};

use super::conn::{Conn, Inner, exec_command_locked};

/// A transaction scope on a synchronous connection.
///
/// Created by [`Conn::transaction`]; the value handed to the closure
/// identifies the scope so a [`Error::Rollback`] signal can target it.
/// The scope holds only a weak reference back to its connection.
pub struct Transaction<H: ProtocolHandle> {
    conn: Weak<Inner<H>>,
    id: ScopeId,
    savepoint_name: Option<String>,
    is_outer: bool,
}

impl<H: ProtocolHandle> Transaction<H> {
    pub(crate) fn new(conn: &Conn<H>, record: &ScopeRecord) -> Self {
        Self {
            conn: std::sync::Arc::downgrade(&conn.inner),
            id: record.id,
            savepoint_name: record.savepoint.clone(),
            is_outer: record.is_outer,
        }
    }

    /// The connection this scope runs on, if it is still alive.
    pub fn connection(&self) -> Option<Conn<H>> {
        self.conn.upgrade().map(|inner| Conn { inner })
    }

    /// The savepoint created by this scope, if any.
    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint_name.as_deref()
    }

    /// True when this scope issued `BEGIN` rather than `SAVEPOINT`.
    pub fn is_outer(&self) -> bool {
        self.is_outer
    }

    /// Identity of this scope.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// A rollback signal targeting this scope.
    ///
    /// Return it as an error from the scope closure to roll the scope back
    /// without propagating an error; every frame between the raising point
    /// and this scope rolls back too.
    pub fn rollback(&self) -> Error {
        Error::Rollback(Some(self.id))
    }
}

/// Start a scope: `BEGIN` for the outer frame, `SAVEPOINT` for inner ones.
/// The whole sequence runs under the connection lock.
pub(crate) fn enter<H: ProtocolHandle>(
    conn: &Conn<H>,
    options: &TransactionOptions,
) -> Result<ScopeRecord> {
    let mut session = lock(&conn.inner.session);
    let (is_outer, savepoint) = session.scope_entry_shape(options.savepoint_name.clone())?;
    let prior_autocommit = conn.inner.autocommit.load(Ordering::SeqCst);

    if is_outer {
        exec_command_locked(&mut session, "BEGIN")?;
        session.record_entered(true, None);
        conn.inner.autocommit.store(false, Ordering::SeqCst);
    }
    if let Some(name) = &savepoint {
        match exec_command_locked(&mut session, &format!("SAVEPOINT {name}")) {
            Ok(()) => session.record_entered(false, Some(name.as_str())),
            Err(e) => {
                if is_outer {
                    // Unwind the BEGIN this enter already issued.
                    if let Err(cleanup) = exec_command_locked(&mut session, "ROLLBACK") {
                        tracing::warn!("error ignored unwinding failed scope entry: {cleanup}");
                    }
                    session.pop_outer();
                    conn.inner
                        .autocommit
                        .store(prior_autocommit, Ordering::SeqCst);
                }
                return Err(e);
            }
        }
    }

    Ok(ScopeRecord {
        id: next_scope_id(),
        is_outer,
        savepoint,
        prior_autocommit,
    })
}

/// Close a scope, undoing exactly what its enter did. Runs under the
/// connection lock; the stack is popped and autocommit restored even when a
/// closing command fails.
pub(crate) fn exit<H: ProtocolHandle>(
    conn: &Conn<H>,
    record: &ScopeRecord,
    commit: bool,
) -> Result<()> {
    let mut session = lock(&conn.inner.session);
    let mut first_error = None;

    if let Some(name) = &record.savepoint {
        session.pop_named(name);
        let command = if commit {
            format!("RELEASE SAVEPOINT {name}")
        } else {
            format!("ROLLBACK TO SAVEPOINT {name}")
        };
        if let Err(e) = exec_command_locked(&mut session, &command) {
            if commit {
                first_error = Some(e);
            } else {
                tracing::warn!("error ignored in scope rollback: {e}");
            }
        }
    }

    if record.is_outer {
        session.pop_outer();
        let command = if commit && first_error.is_none() {
            Some("COMMIT")
        } else if commit {
            // The release already failed; the server transaction is no
            // longer committable.
            None
        } else {
            Some("ROLLBACK")
        };
        if let Some(command) = command {
            if let Err(e) = exec_command_locked(&mut session, command) {
                if commit {
                    first_error = Some(e);
                } else {
                    tracing::warn!("error ignored in scope rollback: {e}");
                }
            }
        }
        conn.inner
            .autocommit
            .store(record.prior_autocommit, Ordering::SeqCst);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Apply the outcome of the scope closure: commit on success, roll back on
/// failure or `force_rollback`, swallow a rollback signal addressed to this
/// scope.
pub(crate) fn finish<H: ProtocolHandle, T>(
    conn: &Conn<H>,
    record: &ScopeRecord,
    force_rollback: bool,
    result: Result<T>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => {
            exit(conn, record, !force_rollback)?;
            Ok(Some(value))
        }
        Err(Error::Rollback(target)) if target.is_none() || target == Some(record.id) => {
            exit(conn, record, false)?;
            Ok(None)
        }
        Err(err) => {
            // Cleanup failures are logged inside exit; the original error
            // wins.
            let _ = exit(conn, record, false);
            Err(err)
        }
    }
}
