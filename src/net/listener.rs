//! Listening endpoint acquisition and bounded accept.
//!
//! # Responsibilities
//! - Bind a fresh TCP endpoint, or rebuild one from an inherited descriptor
//! - Validate inherited descriptors before adopting them
//! - Produce close-on-exec duplicates for handoff to a successor
//! - Accept incoming TCP connections under a `max_connections` semaphore
//!
//! # Design Decisions
//! - Inherited descriptors are never rebound; the kernel socket (and its backlog)
//!   is the same object the predecessor accepted on
//! - Duplicates are numbered above the child ordinals so they can be remapped
//!   in the child without clobbering each other
//! - An inherited descriptor that fails validation is closed; the process
//!   exits anyway

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use socket2::{Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Lowest descriptor number handed out by [`duplicate_above`] for child handoff.
pub const DUPLICATE_FLOOR: RawFd = 10;

/// How the process obtains its listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Bind a new endpoint on this address.
    Fresh(SocketAddr),
    /// Adopt the pre-opened descriptor with this ordinal.
    Inherited(RawFd),
}

/// Address family of a listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl From<&SocketAddr> for AddressFamily {
    fn from(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

/// Where a listener came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOrigin {
    Fresh,
    Inherited,
}

/// Error type for listener acquisition.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The inherited descriptor is not a listening stream socket.
    #[error("inherited descriptor {fd} is not a listening TCP socket: {reason}")]
    InvalidDescriptor { fd: RawFd, reason: String },
}

/// A listening endpoint owned by the process that accepts on it.
#[derive(Debug)]
pub struct ListenerHandle {
    inner: TcpListener,
    local_addr: SocketAddr,
    family: AddressFamily,
    origin: ListenerOrigin,
}

impl ListenerHandle {
    /// Local address the endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn origin(&self) -> ListenerOrigin {
        self.origin
    }

    /// Duplicate the descriptor for a successor. The duplicate is close-on-exec
    /// and numbered at or above [`DUPLICATE_FLOOR`].
    pub fn duplicate_for_child(&self) -> io::Result<OwnedFd> {
        duplicate_above(self.as_fd(), DUPLICATE_FLOOR)
    }

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    fn from_tokio(inner: TcpListener, origin: ListenerOrigin) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            family: AddressFamily::from(&local_addr),
            inner,
            local_addr,
            origin,
        })
    }
}

impl AsFd for ListenerHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Obtain a listening endpoint.
pub async fn acquire(mode: AcquireMode) -> Result<ListenerHandle, AcquireError> {
    let handle = match mode {
        AcquireMode::Fresh(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| AcquireError::Bind { addr, source })?;
            ListenerHandle::from_tokio(listener, ListenerOrigin::Fresh)
                .map_err(|source| AcquireError::Bind { addr, source })?
        }
        AcquireMode::Inherited(fd) => adopt_inherited(fd)?,
    };

    tracing::info!(
        address = %handle.local_addr,
        family = ?handle.family,
        origin = ?handle.origin,
        fd = handle.as_fd().as_raw_fd(),
        "Listener acquired"
    );
    Ok(handle)
}

fn adopt_inherited(fd: RawFd) -> Result<ListenerHandle, AcquireError> {
    let invalid = |reason: String| AcquireError::InvalidDescriptor { fd, reason };

    ensure_open_socket(fd).map_err(invalid)?;
    // SAFETY: fd is an open socket that nothing else in this process owns;
    // ownership moves into the socket2 wrapper.
    let socket = unsafe { Socket::from_raw_fd(fd) };
    validate_listening_socket(&socket).map_err(invalid)?;

    socket
        .set_cloexec(true)
        .map_err(|e| invalid(format!("failed to set close-on-exec: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| invalid(format!("failed to set non-blocking: {e}")))?;
    let listener = TcpListener::from_std(socket.into())
        .map_err(|e| invalid(format!("failed to register with the runtime: {e}")))?;

    ListenerHandle::from_tokio(listener, ListenerOrigin::Inherited)
        .map_err(|e| invalid(format!("not an IP socket: {e}")))
}

fn ensure_open_socket(fd: RawFd) -> Result<(), String> {
    if fd < 0 {
        return Err("negative descriptor".to_string());
    }

    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(format!("fstat failed: {}", io::Error::last_os_error()));
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err("not a socket".to_string());
    }
    Ok(())
}

/// Check that `socket` is a listening stream socket.
fn validate_listening_socket(socket: &Socket) -> Result<(), String> {
    let sock_type = socket.r#type().map_err(|e| format!("SO_TYPE: {e}"))?;
    if sock_type != Type::STREAM {
        return Err(format!("socket type {sock_type:?} is not SOCK_STREAM"));
    }
    if !is_listening(socket).map_err(|e| format!("SO_ACCEPTCONN: {e}"))? {
        return Err("socket is not listening".to_string());
    }
    Ok(())
}

#[cfg(any(
    target_os = "android",
    target_os = "freebsd",
    target_os = "fuchsia",
    target_os = "linux"
))]
fn is_listening(socket: &Socket) -> io::Result<bool> {
    socket.is_listener()
}

#[cfg(not(any(
    target_os = "android",
    target_os = "freebsd",
    target_os = "fuchsia",
    target_os = "linux"
)))]
fn is_listening(socket: &Socket) -> io::Result<bool> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value != 0)
}

/// Mark a non-socket descriptor (e.g. an inherited pipe) close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicate `fd` as close-on-exec with a number no lower than `floor`.
pub fn duplicate_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Error type for accept operations.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("failed to accept: {0}")]
    Io(#[from] io::Error),
    #[error("connection limiter closed")]
    LimiterClosed,
}

/// A bounded acceptor that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
/// This is the only strong owner of the [`ListenerHandle`]; dropping it closes
/// the endpoint in this process.
pub struct Listener {
    inner: Arc<ListenerHandle>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Wrap an acquired endpoint with a connection limit.
    pub fn new(handle: Arc<ListenerHandle>, max_connections: usize) -> Self {
        Self {
            inner: handle,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), AcceptError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AcceptError::LimiterClosed)?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
