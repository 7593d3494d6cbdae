//! Cancel-aware socket I/O primitives
//!
//! Every blocking operation in the runtime funnels through this module so
//! that shutdown is observed promptly and raw `std::io::Error` values are
//! classified into [`TransportError`] kinds before they reach a transport.
//!
//! The cancellation channel is a [`Shutdown`] handle shared by all tasks of
//! one transport: a stored flag with acquire/release semantics plus a
//! notifier that wakes any suspended I/O immediately. Readiness waits
//! additionally poll the flag on a bounded quantum so a missed wakeup can
//! never stall teardown.

use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::{Result, TransportError};

/// Upper bound on any single internal wait, so the shutdown flag is
/// re-checked promptly even under a long caller-supplied timeout.
pub const POLL_QUANTUM: Duration = Duration::from_millis(500);

/// Shared shutdown signal for one transport instance.
///
/// Cloning is cheap; all clones observe the same flag. `trigger` is
/// idempotent and wakes every waiter currently suspended in this module.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown flag and wake all suspended waiters.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Returns `true` once [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Suspend until the flag is set.
    ///
    /// Registration happens before the flag re-check, so a concurrent
    /// `trigger` cannot be missed.
    pub async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket has data to read.
    Ready,
    /// The caller's deadline elapsed first.
    TimedOut,
    /// Shutdown was triggered while waiting.
    Cancelled,
}

/// Classify an I/O error into the transport error model.
///
/// Connection teardown by the peer (reset, abort, broken pipe, EOF inside
/// an exact read) maps to [`TransportError::ConnectionClosed`]; everything
/// else stays an I/O error.
pub fn classify_io_error(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => TransportError::ConnectionClosed,
        _ => TransportError::Io(err),
    }
}

/// Write all of `buf`, observing shutdown between kernel calls.
pub async fn send_all<W>(io: &mut W, buf: &[u8], shutdown: &Shutdown) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        _ = shutdown.wait() => Err(TransportError::Cancelled.into()),
        res = io.write_all(buf) => {
            res.map_err(|e| anyhow::Error::from(classify_io_error(e)))
        }
    }
}

/// Gather-write a sequence of buffers, advancing across short writes.
///
/// One vectored syscall is issued per iteration; partially written slices
/// are re-sliced rather than copied. Empty buffers are skipped.
pub async fn send_vectored<W>(io: &mut W, bufs: &[&[u8]], shutdown: &Shutdown) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut written = 0usize;

    while written < total {
        // Rebuild the iovec from the unwritten remainder.
        let mut skipped = 0usize;
        let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(bufs.len());
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            if skipped + buf.len() <= written {
                skipped += buf.len();
                continue;
            }
            let offset = written.saturating_sub(skipped);
            iov.push(IoSlice::new(&buf[offset..]));
            skipped += buf.len();
        }
        if iov.is_empty() {
            break;
        }

        let n = tokio::select! {
            _ = shutdown.wait() => return Err(TransportError::Cancelled.into()),
            res = io.write_vectored(&iov) => {
                res.map_err(|e| anyhow::Error::from(classify_io_error(e)))?
            }
        };
        if n == 0 {
            return Err(TransportError::ConnectionClosed.into());
        }
        written += n;
    }
    Ok(())
}

/// Read exactly `buf.len()` bytes, observing shutdown between kernel calls.
///
/// A peer that closes mid-read surfaces as
/// [`TransportError::ConnectionClosed`].
pub async fn recv_exact<R>(io: &mut R, buf: &mut [u8], shutdown: &Shutdown) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = shutdown.wait() => Err(TransportError::Cancelled.into()),
        res = io.read_exact(buf) => {
            res.map(|_| ()).map_err(|e| anyhow::Error::from(classify_io_error(e)))
        }
    }
}

/// Wait for `stream` to become readable.
///
/// `timeout_ms == 0` means no overall deadline; shutdown is still observed
/// on every [`POLL_QUANTUM`]. Readiness errors are classified like any
/// other I/O failure.
pub async fn wait_readable(
    stream: &TcpStream,
    timeout_ms: u64,
    shutdown: &Shutdown,
) -> Result<Readiness> {
    let deadline = if timeout_ms == 0 {
        None
    } else {
        Some(tokio::time::Instant::now() + Duration::from_millis(timeout_ms))
    };

    loop {
        if shutdown.is_triggered() {
            return Ok(Readiness::Cancelled);
        }

        let quantum = match deadline {
            None => POLL_QUANTUM,
            Some(d) => {
                let now = tokio::time::Instant::now();
                if now >= d {
                    return Ok(Readiness::TimedOut);
                }
                (d - now).min(POLL_QUANTUM)
            }
        };

        tokio::select! {
            _ = shutdown.wait() => return Ok(Readiness::Cancelled),
            _ = tokio::time::sleep(quantum) => {}
            res = stream.readable() => {
                res.map_err(|e| anyhow::Error::from(classify_io_error(e)))?;
                return Ok(Readiness::Ready);
            }
        }
    }
}
