//! HTTP server setup and connection serving.
//!
//! # Responsibilities
//! - Own the bounded accept loop (the only strong owner of the listener)
//! - Serve each accepted connection as HTTP/1.1 on its own task
//! - Report unit-of-work transitions to the [`ConnectionTracker`]
//! - Expose stop/close/wait controls for the drain controller
//! - Give connections accepted before a drain a grace period to send their
//!   first request, so no accepted connection is closed unanswered
//!
//! # Data Flow
//! ```text
//! accept ─▶ connection task ─▶ request head ─▶ tracker.begin (Started)
//!                                   │
//!                                   ▼
//!                              axum Router ─▶ response ─▶ guard.finish (Idle)
//!                                   │
//!                   connection closed ─▶ tracker (Completed)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use crate::lifecycle::startup::ProcessIdentity;
use crate::net::connection::{ConnectionId, ConnectionTracker, WorkEvent};
use crate::net::listener::{ConnectionPermit, Listener, ListenerHandle};

/// Pause after a failed accept (e.g. EMFILE) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// How long a connection with no request yet may wait once a drain starts.
pub const DEFAULT_FIRST_REQUEST_GRACE: Duration = Duration::from_secs(1);

/// HTTP server for one process's share of the endpoint.
pub struct HttpServer {
    router: Router,
    tracker: ConnectionTracker,
    max_connections: usize,
    identity: ProcessIdentity,
    first_request_grace: Duration,
}

impl HttpServer {
    pub fn new(
        router: Router,
        tracker: ConnectionTracker,
        max_connections: usize,
        identity: ProcessIdentity,
    ) -> Self {
        Self {
            router,
            tracker,
            max_connections,
            identity,
            first_request_grace: DEFAULT_FIRST_REQUEST_GRACE,
        }
    }

    /// Grace given to connections that have not sent a request when the drain starts.
    pub fn first_request_grace(mut self, grace: Duration) -> Self {
        self.first_request_grace = grace;
        self
    }

    /// Start accepting on `listener`. Returns once the accept loop is running.
    pub fn start(self, listener: ListenerHandle) -> ServingHandle {
        let listener = Arc::new(listener);
        let weak = Arc::downgrade(&listener);
        let local_addr = listener.local_addr();

        let stop = CancellationToken::new();
        let drain = CancellationToken::new();
        let connections = TaskTracker::new();
        let awaiting = Arc::new(AtomicUsize::new(0));

        tracing::info!(
            address = %local_addr,
            pid = self.identity.pid(),
            instance = %self.identity.instance(),
            role = %self.identity.role(),
            max_connections = self.max_connections,
            "HTTP server starting"
        );

        let accept_task = tokio::spawn(accept_loop(
            Listener::new(listener, self.max_connections),
            self.router,
            self.tracker,
            stop.clone(),
            drain.clone(),
            connections.clone(),
            ConnectionSettings {
                awaiting: awaiting.clone(),
                first_request_grace: self.first_request_grace,
            },
        ));

        ServingHandle {
            local_addr,
            listener: weak,
            stop,
            drain,
            accept_task: Some(accept_task),
            connections,
            awaiting,
        }
    }
}

/// Control surface of a running server.
pub struct ServingHandle {
    local_addr: SocketAddr,
    listener: Weak<ListenerHandle>,
    stop: CancellationToken,
    drain: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    connections: TaskTracker,
    awaiting: Arc<AtomicUsize>,
}

impl ServingHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Weak reference to the listener; upgrades fail once accepting stops.
    pub fn listener(&self) -> Weak<ListenerHandle> {
        self.listener.clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the accept loop and close this process's listener descriptor.
    pub async fn stop_accepting(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop terminated abnormally");
            }
        }
        self.connections.close();
        tracing::info!(address = %self.local_addr, "Listener closed");
    }

    /// Ask open connections to finish their current request and close.
    pub fn close_connections(&self) {
        self.drain.cancel();
    }

    /// Number of connection tasks still running.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Accepted connections that have not started a request and are still
    /// inside their first-request grace.
    pub fn awaiting_first_request(&self) -> usize {
        self.awaiting.load(Ordering::Acquire)
    }

    /// Wait up to `grace` for every connection task to exit.
    /// Only completes early after [`ServingHandle::stop_accepting`].
    pub async fn wait_connections(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_ok()
    }
}

impl Drop for ServingHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Clone)]
struct ConnectionSettings {
    awaiting: Arc<AtomicUsize>,
    first_request_grace: Duration,
}

/// Counts a connection in `awaiting` until its first request starts, its
/// grace runs out, or it closes.
struct FirstRequest {
    awaiting: Arc<AtomicUsize>,
    settled: AtomicBool,
    started: Notify,
}

impl FirstRequest {
    fn new(awaiting: Arc<AtomicUsize>) -> Self {
        awaiting.fetch_add(1, Ordering::AcqRel);
        Self {
            awaiting,
            settled: AtomicBool::new(false),
            started: Notify::new(),
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    fn settle(&self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.awaiting.fetch_sub(1, Ordering::AcqRel);
            self.started.notify_one();
        }
    }
}

impl Drop for FirstRequest {
    fn drop(&mut self) {
        self.settle();
    }
}

async fn accept_loop(
    listener: Listener,
    router: Router,
    tracker: ConnectionTracker,
    stop: CancellationToken,
    drain: CancellationToken,
    connections: TaskTracker,
    settings: ConnectionSettings,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer, permit)) => {
                let id = tracker.next_connection_id();
                tracing::debug!(connection_id = %id, peer_addr = %peer, "Serving connection");
                // Counted before the task runs so a drain never misses it.
                let first = Arc::new(FirstRequest::new(settings.awaiting.clone()));
                connections.spawn(serve_connection(
                    stream,
                    id,
                    permit,
                    router.clone(),
                    tracker.clone(),
                    drain.clone(),
                    first,
                    settings.first_request_grace,
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed; retrying");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    tracing::debug!(address = %listener.local_addr(), "Accept loop stopped");
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    stream: TcpStream,
    id: ConnectionId,
    _permit: ConnectionPermit,
    router: Router,
    tracker: ConnectionTracker,
    drain: CancellationToken,
    first: Arc<FirstRequest>,
    first_request_grace: Duration,
) {
    let service = {
        let tracker = tracker.clone();
        let first = first.clone();
        service_fn(move |request: Request<Incoming>| {
            let router = router.clone();
            let guard = tracker.begin(id);
            first.settle();
            async move {
                let response = router.oneshot(request).await;
                guard.finish();
                response
            }
        })
    };

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = drain.cancelled() => {
            let closed_early = if first.is_settled() {
                None
            } else {
                tokio::select! {
                    result = connection.as_mut() => Some(result),
                    _ = first.started.notified() => None,
                    _ = tokio::time::sleep(first_request_grace) => None,
                }
            };
            match closed_early {
                Some(result) => result,
                None => {
                    first.settle();
                    // In-flight requests still get their response.
                    connection.as_mut().graceful_shutdown();
                    connection.as_mut().await
                }
            }
        }
    };

    tracker.observe(id, WorkEvent::Completed);
    match result {
        Ok(()) => tracing::debug!(connection_id = %id, "Connection closed"),
        Err(e) => tracing::debug!(connection_id = %id, error = %e, "Connection closed with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::listener::{acquire, AcquireMode};
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(router: Router, tracker: ConnectionTracker) -> ServingHandle {
        start_with_grace(router, tracker, DEFAULT_FIRST_REQUEST_GRACE).await
    }

    async fn start_with_grace(
        router: Router,
        tracker: ConnectionTracker,
        grace: Duration,
    ) -> ServingHandle {
        let listener = acquire(AcquireMode::Fresh("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        HttpServer::new(router, tracker, 16, ProcessIdentity::fresh())
            .first_request_grace(grace)
            .start(listener)
    }

    async fn wait_awaiting(serving: &ServingHandle, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while serving.awaiting_first_request() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn raw_get(addr: SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_requests_and_tracks_completion() {
        let tracker = ConnectionTracker::new();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let serving = start(router, tracker.clone()).await;
        assert!(serving.is_accepting());

        let response = raw_get(serving.local_addr()).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("ok"));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_request_is_counted() {
        let tracker = ConnectionTracker::new();
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let router = Router::new().route(
            "/",
            get(move || {
                let mut release = release_rx.clone();
                async move {
                    let _ = release.wait_for(|go| *go).await;
                    "done"
                }
            }),
        );
        let serving = start(router, tracker.clone()).await;

        let request = tokio::spawn(raw_get(serving.local_addr()));
        while tracker.active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(tracker.active_count(), 1);

        release_tx.send(true).unwrap();
        let response = request.await.unwrap();
        assert!(response.ends_with("done"));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn stop_accepting_closes_listener() {
        let tracker = ConnectionTracker::new();
        let mut serving = start(Router::new(), tracker).await;
        let addr = serving.local_addr();

        serving.stop_accepting().await;
        assert!(!serving.is_accepting());
        assert!(serving.listener().upgrade().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(serving.wait_connections(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn idle_keepalive_connections_close_on_drain() {
        let tracker = ConnectionTracker::new();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let mut serving = start(router, tracker).await;

        let mut idle = TcpStream::connect(serving.local_addr()).await.unwrap();
        idle.write_all(b"GET / HTTP/1.1\r\nhost: test\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let n = idle.read(&mut buf).await.unwrap();
        assert!(n > 0);

        serving.stop_accepting().await;
        serving.close_connections();
        assert!(serving.wait_connections(Duration::from_secs(2)).await);
        assert_eq!(serving.open_connections(), 0);
    }

    #[tokio::test]
    async fn accepted_connection_is_answered_after_drain_starts() {
        let tracker = ConnectionTracker::new();
        let router = Router::new().route("/", get(|| async { "ok" }));
        let mut serving = start(router, tracker).await;

        let mut stream = TcpStream::connect(serving.local_addr()).await.unwrap();
        wait_awaiting(&serving, 1).await;

        serving.stop_accepting().await;
        serving.close_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: test\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response:?}");
        assert!(response.ends_with("ok"));
        assert!(serving.wait_connections(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn unused_connection_closes_when_grace_runs_out() {
        let tracker = ConnectionTracker::new();
        let mut serving =
            start_with_grace(Router::new(), tracker, Duration::from_millis(100)).await;

        let mut stream = TcpStream::connect(serving.local_addr()).await.unwrap();
        wait_awaiting(&serving, 1).await;

        serving.stop_accepting().await;
        serving.close_connections();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
        assert_eq!(serving.awaiting_first_request(), 0);
        assert!(serving.wait_connections(Duration::from_secs(1)).await);
    }
}
