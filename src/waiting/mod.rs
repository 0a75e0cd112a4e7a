//! Waiting on the connection socket in different contexts.
//!
//! The protocol is driven by a `Driver`: a state machine that never blocks,
//! but tells its caller what readiness it needs before it can go on. The
//! functions in this module do the actual waiting and resume the driver with
//! the readiness observed, until it returns its final value.
//!
//! Strategies:
//! - `selector`: generic OS multiplexor, one-shot registration per step
//! - `epoll`: edge notification with one-shot re-arming (Linux)
//! - `asyncio`: tokio reactor, for async callers
//! - `wait_conn` / `wait_conn_async`: connection establishment, where the
//!   driver may switch sockets between steps
//!
//! All four share one contract: step the driver with no readiness, wait for
//! what it asks, check the readiness against the request, resume it. Only the
//! two blocking steady-state strategies are `WaitStrategy` variants, because
//! only they can be swapped behind the same signature. The async wait returns
//! a future, so it can't share a blocking `fn`; the connection wait takes no
//! socket, because its `ConnDriver` names a possibly different one at every
//! step. Both stay free functions with their own entry points.
//!
//! The blocking steady-state strategy is probed once per process, see
//! `default_strategy()`.

use std::ops::{BitOr, BitOrAssign, ControlFlow};
use std::os::fd::RawFd;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::PgResult;

pub mod asyncio;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;
pub mod selector;

#[cfg(test)]
mod tests;

pub use asyncio::{wait_async, wait_conn_async};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::wait_epoll;
pub use selector::{wait_conn, wait_selector};

// ============================================================================
// Readiness
// ============================================================================

/// What a driver is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Read,
    Write,
    ReadWrite,
}

impl Wait {
    /// True if read readiness is requested.
    pub fn is_readable(self) -> bool {
        matches!(self, Wait::Read | Wait::ReadWrite)
    }

    /// True if write readiness is requested.
    pub fn is_writable(self) -> bool {
        matches!(self, Wait::Write | Wait::ReadWrite)
    }

    /// The readiness bits this request is satisfied by.
    pub fn ready(self) -> Ready {
        match self {
            Wait::Read => Ready::READ,
            Wait::Write => Ready::WRITE,
            Wait::ReadWrite => Ready::READ | Ready::WRITE,
        }
    }
}

/// Readiness observed on a socket: a set of read/write bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READ: Ready = Ready(0b01);
    pub const WRITE: Ready = Ready(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if this readiness satisfies at least one bit of `wait`.
    pub fn intersects(self, wait: Wait) -> bool {
        self.0 & wait.ready().0 != 0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Ready {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("Ready(RW)"),
            (true, false) => f.write_str("Ready(R)"),
            (false, true) => f.write_str("Ready(W)"),
            (false, false) => f.write_str("Ready(-)"),
        }
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Outcome of one driver step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    NeedRead,
    NeedWrite,
    NeedBoth,
    Done(T),
}

impl<T> Step<T> {
    /// A pending step asking for `wait`.
    pub fn pending(wait: Wait) -> Self {
        match wait {
            Wait::Read => Step::NeedRead,
            Wait::Write => Step::NeedWrite,
            Wait::ReadWrite => Step::NeedBoth,
        }
    }

    pub(crate) fn into_flow(self) -> ControlFlow<T, Wait> {
        match self {
            Step::NeedRead => ControlFlow::Continue(Wait::Read),
            Step::NeedWrite => ControlFlow::Continue(Wait::Write),
            Step::NeedBoth => ControlFlow::Continue(Wait::ReadWrite),
            Step::Done(rv) => ControlFlow::Break(rv),
        }
    }
}

/// Outcome of one connection driver step: pending steps carry the socket to
/// wait on, which may differ from the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnStep<T> {
    NeedRead(RawFd),
    NeedWrite(RawFd),
    NeedBoth(RawFd),
    Done(T),
}

impl<T> ConnStep<T> {
    /// A pending step asking for `wait` on `fd`.
    pub fn pending(fd: RawFd, wait: Wait) -> Self {
        match wait {
            Wait::Read => ConnStep::NeedRead(fd),
            Wait::Write => ConnStep::NeedWrite(fd),
            Wait::ReadWrite => ConnStep::NeedBoth(fd),
        }
    }

    pub(crate) fn into_flow(self) -> ControlFlow<T, (RawFd, Wait)> {
        match self {
            ConnStep::NeedRead(fd) => ControlFlow::Continue((fd, Wait::Read)),
            ConnStep::NeedWrite(fd) => ControlFlow::Continue((fd, Wait::Write)),
            ConnStep::NeedBoth(fd) => ControlFlow::Continue((fd, Wait::ReadWrite)),
            ConnStep::Done(rv) => ControlFlow::Break(rv),
        }
    }
}

/// A suspendable protocol operation on a fixed socket.
///
/// `step` is called first with `None`, then with the readiness observed for
/// each request it returned. It must never block.
pub trait Driver {
    type Output;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<Step<Self::Output>>;
}

impl<F, T> Driver for F
where
    F: FnMut(Option<Ready>) -> PgResult<Step<T>>,
{
    type Output = T;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<Step<T>> {
        self(ready)
    }
}

/// A suspendable connection attempt: like `Driver`, but each pending step
/// names the socket to wait on.
pub trait ConnDriver {
    type Output;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<ConnStep<Self::Output>>;
}

impl<F, T> ConnDriver for F
where
    F: FnMut(Option<Ready>) -> PgResult<ConnStep<T>>,
{
    type Output = T;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<ConnStep<T>> {
        self(ready)
    }
}

/// Readiness that shares nothing with the request is a bug in the driver or
/// in the waiter, not a runtime condition: fail loudly.
pub(crate) fn check_ready(wait: Wait, ready: Ready) {
    assert!(
        ready.intersects(wait),
        "readiness {:?} doesn't satisfy request {:?}",
        ready,
        wait
    );
}

// ============================================================================
// Strategy Selection
// ============================================================================

/// Blocking strategy used for steady-state operations.
///
/// `wait_async` and `wait_conn` have different signatures and are called
/// directly; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Generic multiplexor (`wait_selector`).
    Selector,
    /// Edge notification with one-shot re-arming (`wait_epoll`).
    Epoll,
}

impl WaitStrategy {
    /// The best strategy the host supports.
    pub fn available() -> Self {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if epoll::is_supported() {
                return WaitStrategy::Epoll;
            }
        }
        WaitStrategy::Selector
    }

    /// Drive `driver` to completion waiting on `fd`.
    ///
    /// `timeout` only bounds each poll so the caller gets a chance to notice
    /// interrupts; an empty poll is retried.
    pub fn wait<D>(self, driver: &mut D, fd: RawFd, timeout: Option<Duration>) -> PgResult<D::Output>
    where
        D: Driver + ?Sized,
    {
        match self {
            WaitStrategy::Selector => wait_selector(driver, fd, timeout),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitStrategy::Epoll => wait_epoll(driver, fd, timeout),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            WaitStrategy::Epoll => Err(crate::error::PgError::Internal(
                "epoll is not available on this platform".to_string(),
            )),
        }
    }
}

static DEFAULT_STRATEGY: Lazy<WaitStrategy> = Lazy::new(|| {
    let strategy = WaitStrategy::available();
    debug!(?strategy, "selected default wait strategy");
    strategy
});

/// Process-wide default strategy, probed on first use and never changed.
pub fn default_strategy() -> WaitStrategy {
    *DEFAULT_STRATEGY
}

/// Drive `driver` to completion on `fd` with the default strategy.
pub fn wait<D>(driver: &mut D, fd: RawFd, timeout: Option<Duration>) -> PgResult<D::Output>
where
    D: Driver + ?Sized,
{
    default_strategy().wait(driver, fd, timeout)
}

/// Connection timeouts of zero mean "wait forever".
pub(crate) fn conn_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}
