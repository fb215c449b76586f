//! A PostgreSQL driver core.
//!
//! # Features
//!
//! - **Pluggable protocol handle**: the wire protocol lives behind the
//!   [`pq::ProtocolHandle`] trait, a thin seam over a libpq-style native
//!   client library
//! - **Resumable I/O flows**: connection setup and query execution are
//!   state machines that yield readiness requests, driven unchanged by the
//!   blocking and cooperative waiters
//! - **Sync and async APIs**: choose between synchronous and tokio-based
//!   connections with identical semantics
//! - **Nestable transaction scopes**: `BEGIN`/`COMMIT`/`ROLLBACK` at the
//!   outer level, savepoints for inner levels, commit-on-success and
//!   rollback-on-failure
//!
//! # Example
//!
//! ```no_run
//! use pqlink::{ConnectOptions, Result};
//! use pqlink::sync::Conn;
//! # use pqlink::pq::ProtocolHandle;
//!
//! fn run<H: ProtocolHandle>() -> Result<()> {
//!     let conn: Conn<H> = Conn::connect("host=localhost user=postgres", ConnectOptions::default())?;
//!
//!     let committed = conn.transaction(|_tx| {
//!         conn.execute("INSERT INTO t VALUES ('a')")?;
//!         conn.transaction(|_inner| {
//!             conn.execute("INSERT INTO t VALUES ('b')")
//!         })?;
//!         Ok(())
//!     })?;
//!     assert!(committed.is_some());
//!
//!     conn.close();
//!     Ok(())
//! }
//! ```
//!
//! The initial session encoding honors the `PGCLIENTENCODING` environment
//! variable, which the native protocol library consumes during connection
//! startup.

// private
mod conninfo;
mod error;
mod opts;
mod session;

// pub
pub mod encoding;
pub mod pq;
pub mod state;

#[cfg(feature = "sync")]
pub mod sync;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use conninfo::make_conninfo;
pub use encoding::Codec;
pub use error::{Error, Result, ScopeId};
pub use opts::{ConnectOptions, TransactionOptions};
pub use session::ListenerToken;
