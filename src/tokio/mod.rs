//! Asynchronous driver for tokio.

mod conn;
mod transaction;
mod wait;

pub use conn::Conn;
pub use transaction::Transaction;
