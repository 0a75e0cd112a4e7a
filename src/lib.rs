//! pgwait - the concurrency and statement caching core of a PostgreSQL client.
//!
//! - `waiting`: drives a non-blocking protocol state machine to completion,
//!   blocking on the OS multiplexor, on epoll, or awaiting the tokio reactor
//! - `prepare`: per-connection record of executed queries, deciding when to
//!   prepare them server-side and which `DEALLOCATE` to send
//!
//! Neither part is shared between threads: a connection runs one operation
//! at a time, and its driver and cache live with it.

pub mod config;
pub mod error;
pub mod prepare;
pub mod waiting;


pub use config::{PrepareConfig, WaitConfig};
pub use error::{PgError, PgResult};
pub use prepare::{
    ExecStatus, Key, MaintenanceCommand, Oid, Prepare, PrepareManager, ResultSummary, Value,
};
pub use waiting::{
    default_strategy, wait, wait_async, wait_conn, wait_conn_async, wait_selector, ConnDriver,
    ConnStep, Driver, Ready, Step, Wait, WaitStrategy,
};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use waiting::wait_epoll;
