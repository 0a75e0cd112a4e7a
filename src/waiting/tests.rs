//! Behaviour shared by every wait strategy, checked against real sockets.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::error::{PgError, PgResult};

// ============================================================================
// Fixtures
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn socket_pair() -> (UnixStream, UnixStream) {
    init_tracing();
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

/// Asks for read readiness, then returns whatever it can read.
struct Reader {
    sock: UnixStream,
    seen: Vec<Ready>,
}

impl Reader {
    fn new(sock: UnixStream) -> Self {
        Self { sock, seen: Vec::new() }
    }
}

impl Driver for Reader {
    type Output = Vec<u8>;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<Step<Vec<u8>>> {
        let Some(ready) = ready else {
            return Ok(Step::NeedRead);
        };
        self.seen.push(ready);
        let mut buf = [0u8; 64];
        let n = self.sock.read(&mut buf)?;
        Ok(Step::Done(buf[..n].to_vec()))
    }
}

/// Sends a request, then waits for the reply: write, read, done.
struct PingPong {
    sock: UnixStream,
    sent: bool,
}

impl Driver for PingPong {
    type Output = Vec<u8>;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<Step<Vec<u8>>> {
        match (ready, self.sent) {
            (None, _) => Ok(Step::NeedWrite),
            (Some(ready), false) => {
                assert!(ready.is_writable());
                self.sock.write_all(b"ping")?;
                self.sent = true;
                Ok(Step::NeedRead)
            }
            (Some(ready), true) => {
                assert!(ready.is_readable());
                let mut buf = [0u8; 64];
                let n = self.sock.read(&mut buf)?;
                Ok(Step::Done(buf[..n].to_vec()))
            }
        }
    }
}

/// Answers every "ping" on the other end of the pair.
fn spawn_ponger(mut peer: UnixStream) -> thread::JoinHandle<()> {
    peer.set_nonblocking(false).unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        peer.write_all(b"pong").unwrap();
    })
}

fn write_later(mut peer: UnixStream, delay: Duration, data: &'static [u8]) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(delay);
        peer.write_all(data).unwrap();
    })
}

/// Connection driver reading once from each socket in turn.
struct Hopper {
    socks: Vec<UnixStream>,
    next: usize,
    got: Vec<u8>,
}

impl Hopper {
    fn new(socks: Vec<UnixStream>) -> Self {
        Self { socks, next: 0, got: Vec::new() }
    }

    fn fd(&self, i: usize) -> RawFd {
        self.socks[i].as_raw_fd()
    }
}

impl ConnDriver for Hopper {
    type Output = Vec<u8>;

    fn step(&mut self, ready: Option<Ready>) -> PgResult<ConnStep<Vec<u8>>> {
        if ready.is_some() {
            let mut buf = [0u8; 64];
            let n = self.socks[self.next].read(&mut buf)?;
            self.got.extend_from_slice(&buf[..n]);
            self.next += 1;
        }
        if self.next == self.socks.len() {
            return Ok(ConnStep::Done(std::mem::take(&mut self.got)));
        }
        Ok(ConnStep::NeedRead(self.fd(self.next)))
    }
}

fn immediate(_ready: Option<Ready>) -> PgResult<Step<u32>> {
    Ok(Step::Done(42))
}

// ============================================================================
// Shared Contract
// ============================================================================

mod contract {
    use super::*;

    #[test]
    fn test_ready_bits() {
        let rw = Ready::READ | Ready::WRITE;
        assert!(rw.is_readable() && rw.is_writable());
        assert!(Ready::READ.intersects(Wait::ReadWrite));
        assert!(!Ready::READ.intersects(Wait::Write));
        assert!(Ready::EMPTY.is_empty());
        assert_eq!(Wait::ReadWrite.ready(), rw);
        assert_eq!(format!("{:?}", rw), "Ready(RW)");
    }

    #[test]
    fn test_step_pending() {
        assert_eq!(Step::<()>::pending(Wait::Read), Step::NeedRead);
        assert_eq!(Step::<()>::pending(Wait::ReadWrite), Step::NeedBoth);
        assert_eq!(ConnStep::<()>::pending(7, Wait::Write), ConnStep::NeedWrite(7));
    }

    #[test]
    #[should_panic(expected = "doesn't satisfy request")]
    fn test_disjoint_readiness_is_fatal() {
        check_ready(Wait::Read, Ready::WRITE);
    }

    #[test]
    fn test_overlapping_readiness_accepted() {
        check_ready(Wait::Read, Ready::READ | Ready::WRITE);
        check_ready(Wait::ReadWrite, Ready::WRITE);
    }

    #[test]
    fn test_immediate_completion_never_polls() {
        // An invalid descriptor would make any registration fail.
        assert_eq!(wait_selector(&mut immediate, -1, None).unwrap(), 42);
        assert_eq!(WaitStrategy::available().wait(&mut immediate, -1, None).unwrap(), 42);
    }

    #[test]
    fn test_driver_error_propagates() {
        let (a, _b) = socket_pair();
        let mut failing = |ready: Option<Ready>| -> PgResult<Step<()>> {
            match ready {
                None => Ok(Step::NeedWrite),
                Some(_) => Err(PgError::Protocol("unexpected message".into())),
            }
        };
        let err = wait(&mut failing, a.as_raw_fd(), None).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_default_strategy_is_stable() {
        let first = default_strategy();
        assert_eq!(first, default_strategy());
        assert_eq!(first, WaitStrategy::available());
        #[cfg(target_os = "linux")]
        assert_eq!(first, WaitStrategy::Epoll);
    }

    #[test]
    fn test_conn_timeout_zero_is_indefinite() {
        assert_eq!(conn_timeout(Some(Duration::ZERO)), None);
        assert_eq!(conn_timeout(None), None);
        assert_eq!(conn_timeout(Some(Duration::from_secs(1))), Some(Duration::from_secs(1)));
    }
}

// ============================================================================
// Blocking Strategies
// ============================================================================

fn strategies() -> Vec<WaitStrategy> {
    let mut all = vec![WaitStrategy::Selector];
    if WaitStrategy::available() == WaitStrategy::Epoll {
        all.push(WaitStrategy::Epoll);
    }
    all
}

mod blocking {
    use super::*;

    #[test]
    fn test_read_then_done() {
        for strategy in strategies() {
            let (a, mut b) = socket_pair();
            b.write_all(b"V").unwrap();
            let mut driver = Reader::new(a);
            let fd = driver.sock.as_raw_fd();
            assert_eq!(strategy.wait(&mut driver, fd, None).unwrap(), b"V", "{:?}", strategy);
            assert_eq!(driver.seen.len(), 1);
            assert!(driver.seen[0].is_readable());
        }
    }

    #[test]
    fn test_write_then_read() {
        for strategy in strategies() {
            let (a, b) = socket_pair();
            let ponger = spawn_ponger(b);
            let fd = a.as_raw_fd();
            let mut driver = PingPong { sock: a, sent: false };
            assert_eq!(strategy.wait(&mut driver, fd, None).unwrap(), b"pong", "{:?}", strategy);
            ponger.join().unwrap();
        }
    }

    #[test]
    fn test_empty_polls_are_retried() {
        for strategy in strategies() {
            let (a, b) = socket_pair();
            let writer = write_later(b, Duration::from_millis(50), b"late");
            let mut driver = Reader::new(a);
            let fd = driver.sock.as_raw_fd();
            let rv = strategy
                .wait(&mut driver, fd, Some(Duration::from_millis(5)))
                .unwrap();
            assert_eq!(rv, b"late", "{:?}", strategy);
            writer.join().unwrap();
        }
    }

    #[test]
    fn test_hangup_wakes_reader() {
        for strategy in strategies() {
            let (a, b) = socket_pair();
            drop(b);
            let mut driver = Reader::new(a);
            let fd = driver.sock.as_raw_fd();
            // EOF: the driver reads zero bytes.
            assert_eq!(strategy.wait(&mut driver, fd, None).unwrap(), b"", "{:?}", strategy);
        }
    }

    #[test]
    fn test_selector_reuses_descriptor_across_steps() {
        let (a, b) = socket_pair();
        let ponger = spawn_ponger(b);
        let fd = a.as_raw_fd();
        let mut driver = PingPong { sock: a, sent: false };
        assert_eq!(wait_selector(&mut driver, fd, Some(Duration::from_millis(10))).unwrap(), b"pong");
        ponger.join().unwrap();
    }

    #[test]
    fn test_closure_driver() {
        let (a, mut b) = socket_pair();
        b.write_all(b"x").unwrap();
        let mut steps = 0;
        let mut driver = |ready: Option<Ready>| -> PgResult<Step<usize>> {
            steps += 1;
            Ok(match ready {
                None => Step::NeedBoth,
                Some(_) => Step::Done(steps),
            })
        };
        assert_eq!(wait(&mut driver, a.as_raw_fd(), None).unwrap(), 2);
    }
}

// ============================================================================
// Connection Establishment
// ============================================================================

mod connection {
    use super::*;

    #[test]
    fn test_follows_descriptor_changes() {
        let (a1, mut b1) = socket_pair();
        let (a2, b2) = socket_pair();
        b1.write_all(b"one").unwrap();
        let writer = write_later(b2, Duration::from_millis(30), b"two");

        let mut driver = Hopper::new(vec![a1, a2]);
        let rv = wait_conn(&mut driver, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(rv, b"onetwo");
        writer.join().unwrap();
    }

    #[test]
    fn test_new_descriptor_needs_its_own_readiness() {
        // The first socket is readable, the second never is: readiness seen
        // on the first must not be reused for the second.
        let (a1, mut b1) = socket_pair();
        let (a2, _b2) = socket_pair();
        b1.write_all(b"one").unwrap();

        let mut driver = Hopper::new(vec![a1, a2]);
        let err = wait_conn(&mut driver, Some(Duration::from_millis(100))).unwrap_err();
        assert!(err.is_timeout(), "{:?}", err);
        assert_eq!(driver.next, 1);
    }

    #[test]
    fn test_timeout_is_bounded() {
        let (a, _b) = socket_pair();
        let mut driver = Hopper::new(vec![a]);
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let err = wait_conn(&mut driver, Some(timeout)).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, PgError::Timeout));
        assert_eq!(err.to_string(), "timeout expired");
        assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
        assert!(elapsed < timeout * 10, "{:?}", elapsed);
    }

    #[test]
    fn test_zero_timeout_waits() {
        let (a, b) = socket_pair();
        let writer = write_later(b, Duration::from_millis(30), b"ok");
        let mut driver = Hopper::new(vec![a]);
        assert_eq!(wait_conn(&mut driver, Some(Duration::ZERO)).unwrap(), b"ok");
        writer.join().unwrap();
    }

    #[test]
    fn test_bad_descriptor_is_io_error() {
        let mut driver = |_ready: Option<Ready>| -> PgResult<ConnStep<()>> {
            Ok(ConnStep::NeedRead(-1))
        };
        let err = wait_conn(&mut driver, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, PgError::Io(_)), "{:?}", err);
    }
}

// ============================================================================
// Async
// ============================================================================

mod asynchronous {
    use super::*;

    #[tokio::test]
    async fn test_read_then_done() {
        let (a, mut b) = socket_pair();
        b.write_all(b"V").unwrap();
        let mut driver = Reader::new(a);
        let fd = driver.sock.as_raw_fd();
        assert_eq!(wait_async(&mut driver, fd, None).await.unwrap(), b"V");
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (a, b) = socket_pair();
        let ponger = spawn_ponger(b);
        let fd = a.as_raw_fd();
        let mut driver = PingPong { sock: a, sent: false };
        assert_eq!(wait_async(&mut driver, fd, None).await.unwrap(), b"pong");
        ponger.join().unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_readiness_is_merged() {
        let (a, mut b) = socket_pair();
        b.write_all(b"both").unwrap();
        // Readable (data queued) and writable (empty send buffer) at once.
        let mut seen = None;
        let mut driver = |ready: Option<Ready>| -> PgResult<Step<()>> {
            match ready {
                None => Ok(Step::NeedBoth),
                Some(ready) => {
                    seen = Some(ready);
                    Ok(Step::Done(()))
                }
            }
        };
        wait_async(&mut driver, a.as_raw_fd(), None).await.unwrap();
        assert_eq!(seen, Some(Ready::READ | Ready::WRITE));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (a, _b) = socket_pair();
        let mut driver = Reader::new(a);
        let fd = driver.sock.as_raw_fd();
        let err = wait_async(&mut driver, fd, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(driver.seen.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_registration() {
        let (a, b) = socket_pair();
        let fd = a.as_raw_fd();
        let mut driver = Reader::new(a);

        // Cancel from outside: the inner future is dropped mid-wait.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(30),
            wait_async(&mut driver, fd, None),
        )
        .await;
        assert!(cancelled.is_err());

        // A leaked registration would make this one fail with EEXIST.
        let writer = write_later(b, Duration::from_millis(20), b"again");
        assert_eq!(wait_async(&mut driver, fd, None).await.unwrap(), b"again");
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_aborted_task_leaves_no_registration() {
        let (a, _b) = socket_pair();
        let fd = a.as_raw_fd();
        let task = tokio::spawn(async move {
            let mut driver = Reader::new(a);
            wait_async(&mut driver, fd, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        // The socket was closed with the task; a new one may reuse the fd.
        let (c, mut d) = socket_pair();
        d.write_all(b"fresh").unwrap();
        let mut driver = Reader::new(c);
        let fd = driver.sock.as_raw_fd();
        assert_eq!(wait_async(&mut driver, fd, None).await.unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn test_conn_follows_descriptor_changes() {
        let (a1, mut b1) = socket_pair();
        let (a2, b2) = socket_pair();
        b1.write_all(b"one").unwrap();
        let writer = write_later(b2, Duration::from_millis(30), b"two");

        let mut driver = Hopper::new(vec![a1, a2]);
        let rv = wait_conn_async(&mut driver, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(rv, b"onetwo");
        writer.join().unwrap();
    }

    #[tokio::test]
    async fn test_conn_timeout() {
        let (a1, mut b1) = socket_pair();
        let (a2, _b2) = socket_pair();
        b1.write_all(b"one").unwrap();

        let mut driver = Hopper::new(vec![a1, a2]);
        let start = Instant::now();
        let err = wait_conn_async(&mut driver, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(driver.next, 1);
    }

    #[tokio::test]
    async fn test_unregistrable_descriptor_is_io_error() {
        let mut driver = |ready: Option<Ready>| -> PgResult<Step<()>> {
            match ready {
                None => Ok(Step::NeedRead),
                Some(_) => Ok(Step::Done(())),
            }
        };
        let err = wait_async(&mut driver, -1, None).await.unwrap_err();
        assert!(matches!(err, PgError::Io(_)));
    }
}

#[test]
fn test_io_error_kind_preserved() {
    let err: PgError = io::Error::from(io::ErrorKind::WouldBlock).into();
    match err {
        PgError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
        other => panic!("unexpected {:?}", other),
    }
}
