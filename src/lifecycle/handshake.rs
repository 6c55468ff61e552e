//! Readiness handshake between successor and predecessor.
//!
//! # Responsibilities
//! - Carry a single fixed sentinel from the successor (write end) to the
//!   predecessor (read end)
//! - Bound the predecessor's wait with a timeout
//! - Classify the result: Ready, TimedOut, Closed (successor died), Invalid
//!
//! # Design Decisions
//! - The read end is closed once an outcome is known, so a late sentinel never
//!   counts; the successor simply sees its write fail
//! - The notifier is single-use; a second notify is an error
//! - Pipe and in-memory implementations share the same traits so the restart
//!   path can be exercised without spawning processes

use std::io::{self, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::oneshot;

/// The one message a successor sends once it is accepting.
pub const READY_SENTINEL: &[u8] = b"ready\n";

/// Upper bound on bytes read while waiting for the sentinel.
const MAX_HANDSHAKE_BYTES: u64 = 64;

/// Result of waiting for the successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The sentinel arrived before the deadline.
    Ready,
    /// The deadline elapsed first.
    TimedOut,
    /// The channel closed without any data.
    Closed,
    /// Something other than the sentinel arrived, or the read failed.
    Invalid(String),
}

/// Successor side of the handshake.
pub trait ReadyNotifier: Send {
    /// Send the sentinel. Succeeds at most once.
    fn notify_ready(&mut self) -> io::Result<()>;
}

/// Predecessor side of the handshake.
#[async_trait]
pub trait ReadyWaiter: Send {
    /// Wait up to `timeout` for the sentinel. The channel is closed on return.
    async fn wait_ready(&mut self, timeout: Duration) -> HandshakeOutcome;
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("inherited handshake descriptor {fd} is not a pipe: {reason}")]
    InvalidDescriptor { fd: RawFd, reason: String },
}

fn classify(received: &[u8]) -> HandshakeOutcome {
    if received.is_empty() {
        HandshakeOutcome::Closed
    } else if received == READY_SENTINEL {
        HandshakeOutcome::Ready
    } else {
        HandshakeOutcome::Invalid(format!(
            "unexpected handshake bytes {:?}",
            String::from_utf8_lossy(received)
        ))
    }
}

fn already_used() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "readiness already signalled")
}

/// Create an anonymous pipe handshake. Both ends are close-on-exec.
pub fn pipe_channel() -> io::Result<(os_pipe::PipeWriter, PipeReadyWaiter)> {
    let (reader, writer) = os_pipe::pipe()?;
    Ok((writer, PipeReadyWaiter::from_reader(reader)?))
}

/// Read end of a pipe handshake, registered with the tokio reactor.
#[derive(Debug)]
pub struct PipeReadyWaiter {
    receiver: Option<pipe::Receiver>,
}

impl PipeReadyWaiter {
    pub fn from_reader(reader: os_pipe::PipeReader) -> io::Result<Self> {
        // SAFETY: into_raw_fd transfers sole ownership of the read end.
        let fd = unsafe { OwnedFd::from_raw_fd(reader.into_raw_fd()) };
        Ok(Self {
            receiver: Some(pipe::Receiver::from_owned_fd(fd)?),
        })
    }
}

#[async_trait]
impl ReadyWaiter for PipeReadyWaiter {
    async fn wait_ready(&mut self, timeout: Duration) -> HandshakeOutcome {
        let Some(receiver) = self.receiver.take() else {
            return HandshakeOutcome::Invalid("handshake already consumed".to_string());
        };

        let mut reader = BufReader::new(receiver).take(MAX_HANDSHAKE_BYTES);
        let mut received = Vec::with_capacity(READY_SENTINEL.len());
        match tokio::time::timeout(timeout, reader.read_until(b'\n', &mut received)).await {
            Err(_) => HandshakeOutcome::TimedOut,
            Ok(Err(e)) => HandshakeOutcome::Invalid(format!("handshake read failed: {e}")),
            Ok(Ok(_)) => classify(&received),
        }
    }
}

/// Write end of a pipe handshake.
#[derive(Debug)]
pub struct PipeReadyNotifier {
    writer: Option<os_pipe::PipeWriter>,
}

impl PipeReadyNotifier {
    pub fn from_writer(writer: os_pipe::PipeWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Adopt the write end passed by the predecessor at ordinal `fd`.
    pub fn from_inherited(fd: RawFd) -> Result<Self, HandshakeError> {
        let invalid = |reason: String| HandshakeError::InvalidDescriptor { fd, reason };
        if fd < 0 {
            return Err(invalid("negative descriptor".to_string()));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            return Err(invalid(format!("fstat failed: {}", io::Error::last_os_error())));
        }
        if (stat.st_mode & libc::S_IFMT) != libc::S_IFIFO {
            return Err(invalid("not a FIFO".to_string()));
        }
        crate::net::listener::set_cloexec(fd)
            .map_err(|e| invalid(format!("failed to set close-on-exec: {e}")))?;

        // SAFETY: fd is an open FIFO handed to this process for its sole use.
        let writer = unsafe { os_pipe::PipeWriter::from_raw_fd(fd) };
        Ok(Self::from_writer(writer))
    }
}

impl ReadyNotifier for PipeReadyNotifier {
    fn notify_ready(&mut self) -> io::Result<()> {
        let mut writer = self.writer.take().ok_or_else(already_used)?;
        writer.write_all(READY_SENTINEL)?;
        writer.flush()
    }
}

/// In-memory handshake for tests and in-process successors.
pub fn memory_channel() -> (MemoryReadyNotifier, MemoryReadyWaiter) {
    let (tx, rx) = oneshot::channel();
    (
        MemoryReadyNotifier { tx: Some(tx) },
        MemoryReadyWaiter { rx: Some(rx) },
    )
}

#[derive(Debug)]
pub struct MemoryReadyNotifier {
    tx: Option<oneshot::Sender<Vec<u8>>>,
}

impl MemoryReadyNotifier {
    /// Send arbitrary bytes in place of the sentinel.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        let tx = self.tx.take().ok_or_else(already_used)?;
        tx.send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "predecessor stopped waiting"))
    }
}

impl ReadyNotifier for MemoryReadyNotifier {
    fn notify_ready(&mut self) -> io::Result<()> {
        self.send_raw(READY_SENTINEL)
    }
}

#[derive(Debug)]
pub struct MemoryReadyWaiter {
    rx: Option<oneshot::Receiver<Vec<u8>>>,
}

#[async_trait]
impl ReadyWaiter for MemoryReadyWaiter {
    async fn wait_ready(&mut self, timeout: Duration) -> HandshakeOutcome {
        let Some(rx) = self.rx.take() else {
            return HandshakeOutcome::Invalid("handshake already consumed".to_string());
        };
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => HandshakeOutcome::TimedOut,
            Ok(Err(_)) => HandshakeOutcome::Closed,
            Ok(Ok(bytes)) => classify(&bytes),
        }
    }
}
