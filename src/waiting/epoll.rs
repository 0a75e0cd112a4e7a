//! Blocking wait on epoll with one-shot re-arming.
//!
//! The socket is added once with `EPOLLONESHOT`; after each event the kernel
//! disables it and we re-arm it with the interest of the next step. This saves
//! the add/remove pair per step that the generic selector pays.

use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::trace;

use super::{check_ready, Driver, Ready, Wait};
use crate::error::{PgError, PgResult};

/// An epoll instance, closed on drop (which also drops its registrations).
struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by epoll_create1 and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    fn register(&self, fd: RawFd, wait: Wait) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, wait)
    }

    fn rearm(&self, fd: RawFd, wait: Wait) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, wait)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, wait: Wait) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: evmask(wait),
            u64: fd as u64,
        };
        // SAFETY: `event` is a valid epoll_event for the duration of the call.
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for one event. `None` if `timeout_ms` elapsed first.
    fn poll(&self, timeout_ms: libc::c_int) -> io::Result<Option<u32>> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }];
        loop {
            // SAFETY: the buffer holds exactly the one event we ask for.
            let n = unsafe {
                libc::epoll_wait(self.fd.as_raw_fd(), events.as_mut_ptr(), 1, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Ok(None);
            }
            let mask = events[0].events;
            return Ok(Some(mask));
        }
    }
}

fn evmask(wait: Wait) -> u32 {
    let mask = match wait {
        Wait::Read => libc::EPOLLIN,
        Wait::Write => libc::EPOLLOUT,
        Wait::ReadWrite => libc::EPOLLIN | libc::EPOLLOUT,
    };
    (mask | libc::EPOLLONESHOT) as u32
}

/// Anything but "writable" wakes the reader, anything but "readable" wakes
/// the writer: errors and hang-ups reach both.
fn event_ready(mask: u32) -> Ready {
    let mut ready = Ready::EMPTY;
    if mask & !(libc::EPOLLOUT as u32) != 0 {
        ready |= Ready::READ;
    }
    if mask & !(libc::EPOLLIN as u32) != 0 {
        ready |= Ready::WRITE;
    }
    ready
}

/// Convert the polling slice to epoll milliseconds; `None` is `-1`, i.e.
/// wait indefinitely. Sub-millisecond remainders round up so a tiny timeout
/// doesn't turn into a busy loop.
fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// True if the kernel lets us create an epoll instance.
pub(crate) fn is_supported() -> bool {
    Epoll::new().is_ok()
}

/// Drive `driver` to completion, waiting on `fd` with epoll.
///
/// Same contract as `wait_selector`: `timeout` is only the polling slice and
/// empty polls are retried.
pub fn wait_epoll<D>(driver: &mut D, fd: RawFd, timeout: Option<Duration>) -> PgResult<D::Output>
where
    D: Driver + ?Sized,
{
    let timeout = timeout_ms(timeout);
    let mut wait = match driver.step(None)?.into_flow() {
        ControlFlow::Break(rv) => return Ok(rv),
        ControlFlow::Continue(wait) => wait,
    };

    let epoll = Epoll::new()?;
    epoll.register(fd, wait)?;
    loop {
        let mask = loop {
            if let Some(mask) = epoll.poll(timeout)? {
                break mask;
            }
            trace!(fd, ?wait, "empty poll, retrying");
        };
        let ready = event_ready(mask);
        if ready.is_empty() {
            return Err(PgError::Internal(format!("bad poll status: {:#x}", mask)));
        }

        check_ready(wait, ready);
        trace!(fd, ?wait, ?ready, "resuming driver");
        wait = match driver.step(Some(ready))?.into_flow() {
            ControlFlow::Break(rv) => return Ok(rv),
            ControlFlow::Continue(wait) => wait,
        };
        epoll.rearm(fd, wait)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(1500))), 1500);
        assert_eq!(timeout_ms(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(event_ready(libc::EPOLLIN as u32), Ready::READ);
        assert_eq!(event_ready(libc::EPOLLOUT as u32), Ready::WRITE);
        assert_eq!(event_ready((libc::EPOLLIN | libc::EPOLLOUT) as u32), Ready::READ | Ready::WRITE);
        assert_eq!(event_ready(libc::EPOLLERR as u32), Ready::READ | Ready::WRITE);
        assert_eq!(event_ready(libc::EPOLLHUP as u32), Ready::READ | Ready::WRITE);
        assert!(event_ready(0).is_empty());
    }

    #[test]
    fn test_evmask_is_oneshot() {
        for wait in [Wait::Read, Wait::Write, Wait::ReadWrite] {
            assert_ne!(evmask(wait) & libc::EPOLLONESHOT as u32, 0);
        }
        assert_eq!(evmask(Wait::Read) & libc::EPOLLOUT as u32, 0);
    }

    #[test]
    fn test_supported() {
        assert!(is_supported());
    }
}
