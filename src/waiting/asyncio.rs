//! Waiting on the tokio reactor.
//!
//! Each suspension registers the socket with the reactor, creates one pending
//! notification per requested direction and races them. Once one resolves, a
//! sibling that is already resolved is merged in, the rest are dropped, and
//! the registration is removed before the driver runs again. Dropping the
//! returned future at any await point (task abort, outer timeout...) also
//! drops the registration, so nothing stays behind in the reactor.
//!
//! The socket must not already be registered with the same runtime (e.g. be
//! owned by a `tokio::net::TcpStream`): registration would fail with an I/O
//! error.

use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use futures::FutureExt;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, trace};

use super::{check_ready, conn_timeout, ConnDriver, Driver, Ready, Wait};
use crate::error::{PgError, PgResult};

/// A socket we wait on but don't own: dropping it doesn't close anything.
struct Descriptor(RawFd);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn interest(wait: Wait) -> Interest {
    match wait {
        Wait::Read => Interest::READABLE,
        Wait::Write => Interest::WRITABLE,
        Wait::ReadWrite => Interest::READABLE | Interest::WRITABLE,
    }
}

/// Wait until `fd` satisfies `wait`, returning all the readiness observed.
async fn ready(fd: RawFd, wait: Wait) -> PgResult<Ready> {
    let registration = AsyncFd::with_interest(Descriptor(fd), interest(wait))?;

    let ready = tokio::select! {
        guard = registration.readable(), if wait.is_readable() => {
            guard?;
            let mut ready = Ready::READ;
            if wait.is_writable() && matches!(registration.writable().now_or_never(), Some(Ok(_))) {
                ready |= Ready::WRITE;
            }
            ready
        }
        guard = registration.writable(), if wait.is_writable() => {
            guard?;
            let mut ready = Ready::WRITE;
            if wait.is_readable() && matches!(registration.readable().now_or_never(), Some(Ok(_))) {
                ready |= Ready::READ;
            }
            ready
        }
    };

    // Deregisters from the reactor.
    drop(registration);
    Ok(ready)
}

async fn ready_within(fd: RawFd, wait: Wait, timeout: Option<Duration>) -> PgResult<Ready> {
    match timeout {
        None => ready(fd, wait).await,
        Some(timeout) => match tokio::time::timeout(timeout, ready(fd, wait)).await {
            Ok(ready) => ready,
            Err(_) => {
                debug!(fd, ?wait, ?timeout, "wait timed out");
                Err(PgError::Timeout)
            }
        },
    }
}

/// Drive `driver` to completion, waiting on `fd` with the tokio reactor.
///
/// If `timeout` is set, each wait fails with `PgError::Timeout` when the
/// socket doesn't become ready in time. `None` waits until it does.
pub async fn wait_async<D>(
    driver: &mut D,
    fd: RawFd,
    timeout: Option<Duration>,
) -> PgResult<D::Output>
where
    D: Driver + ?Sized,
{
    let mut wait = match driver.step(None)?.into_flow() {
        ControlFlow::Break(rv) => return Ok(rv),
        ControlFlow::Continue(wait) => wait,
    };

    loop {
        let ready = ready_within(fd, wait, timeout).await?;
        check_ready(wait, ready);
        trace!(fd, ?wait, ?ready, "resuming driver");
        wait = match driver.step(Some(ready))?.into_flow() {
            ControlFlow::Break(rv) => return Ok(rv),
            ControlFlow::Continue(wait) => wait,
        };
    }
}

/// Drive a connection attempt to completion on the tokio reactor.
///
/// The socket is taken from the driver at every step. `None` or zero
/// `timeout` waits indefinitely, otherwise a step that sees no readiness in
/// time fails with `PgError::Timeout`.
pub async fn wait_conn_async<D>(driver: &mut D, timeout: Option<Duration>) -> PgResult<D::Output>
where
    D: ConnDriver + ?Sized,
{
    let timeout = conn_timeout(timeout);
    let (mut fd, mut wait) = match driver.step(None)?.into_flow() {
        ControlFlow::Break(rv) => return Ok(rv),
        ControlFlow::Continue(pending) => pending,
    };

    loop {
        let ready = ready_within(fd, wait, timeout).await?;
        check_ready(wait, ready);
        trace!(fd, ?wait, ?ready, "resuming connection driver");
        (fd, wait) = match driver.step(Some(ready))?.into_flow() {
            ControlFlow::Break(rv) => return Ok(rv),
            ControlFlow::Continue(pending) => pending,
        };
    }
}
