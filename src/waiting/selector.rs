//! Blocking waits on the generic OS multiplexor.
//!
//! The socket is registered for the readiness the driver asked for, polled,
//! and unregistered again before the driver is resumed, so every step starts
//! from a clean registration.

use std::io;
use std::ops::ControlFlow;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

use super::{check_ready, conn_timeout, ConnDriver, Driver, Ready, Wait};
use crate::error::{PgError, PgResult};

const SOCKET: Token = Token(0);

/// One-socket wrapper around `mio::Poll`.
struct Selector {
    poll: Poll,
    events: Events,
}

impl Selector {
    fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(4),
        })
    }

    fn register(&self, fd: RawFd, wait: Wait) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), SOCKET, interest(wait))
    }

    fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Poll once. `None` if nothing happened within `timeout`.
    ///
    /// Interrupted system calls are restarted with the time left.
    fn select(&mut self, timeout: Option<Duration>) -> PgResult<Option<Ready>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, remaining) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match self.events.iter().find(|event| event.token() == SOCKET) {
            None => Ok(None),
            Some(event) => {
                let ready = event_ready(event);
                if ready.is_empty() {
                    return Err(PgError::Internal(format!("bad poll status: {:?}", event)));
                }
                Ok(Some(ready))
            }
        }
    }
}

fn interest(wait: Wait) -> Interest {
    match wait {
        Wait::Read => Interest::READABLE,
        Wait::Write => Interest::WRITABLE,
        Wait::ReadWrite => Interest::READABLE | Interest::WRITABLE,
    }
}

/// Errors and hang-ups wake both sides: the driver finds out what happened
/// on its next read or write.
fn event_ready(event: &Event) -> Ready {
    let mut ready = Ready::EMPTY;
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        ready |= Ready::READ;
    }
    if event.is_writable() || event.is_write_closed() || event.is_error() {
        ready |= Ready::WRITE;
    }
    ready
}

/// Drive `driver` to completion, waiting on `fd` with the OS multiplexor.
///
/// `timeout` is the length of each poll, so a caller can check for
/// interrupts between polls; an empty poll is simply retried. `None` polls
/// until the socket is ready.
pub fn wait_selector<D>(
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

    let mut selector = Selector::new()?;
    loop {
        selector.register(fd, wait)?;
        let ready = loop {
            if let Some(ready) = selector.select(timeout)? {
                break ready;
            }
            trace!(fd, ?wait, "empty poll, retrying");
        };
        selector.unregister(fd)?;

        check_ready(wait, ready);
        trace!(fd, ?wait, ?ready, "resuming driver");
        wait = match driver.step(Some(ready))?.into_flow() {
            ControlFlow::Break(rv) => return Ok(rv),
            ControlFlow::Continue(wait) => wait,
        };
    }
}

/// Drive a connection attempt to completion.
///
/// Like `wait_selector`, but the socket is taken from the driver at every
/// step, since it may change (e.g. when trying the next host address).
/// `timeout` bounds each wait: if nothing happens in time the attempt fails
/// with `PgError::Timeout`. `None` or zero waits indefinitely.
pub fn wait_conn<D>(driver: &mut D, timeout: Option<Duration>) -> PgResult<D::Output>
where
    D: ConnDriver + ?Sized,
{
    let timeout = conn_timeout(timeout);
    let (mut fd, mut wait) = match driver.step(None)?.into_flow() {
        ControlFlow::Break(rv) => return Ok(rv),
        ControlFlow::Continue(pending) => pending,
    };

    let mut selector = Selector::new()?;
    loop {
        selector.register(fd, wait)?;
        let ready = selector.select(timeout)?;
        selector.unregister(fd)?;

        let Some(ready) = ready else {
            debug!(fd, ?wait, ?timeout, "connection attempt timed out");
            return Err(PgError::Timeout);
        };

        check_ready(wait, ready);
        trace!(fd, ?wait, ?ready, "resuming connection driver");
        (fd, wait) = match driver.step(Some(ready))?.into_flow() {
            ControlFlow::Break(rv) => return Ok(rv),
            ControlFlow::Continue(pending) => pending,
        };
    }
}
