//! HTTP listener for the service's endpoints.
//!
//! [`HttpServer::bind`] claims the socket before anything else happens so the
//! resolved port is known up front. [`HttpServer::serve`] moves the listener
//! into an accept task and returns a [`ServerHandle`] that owns the shutdown
//! sequence:
//!
//! 1. stop accepting new connections
//! 2. ask every open connection to finish its in-flight request
//! 3. wait up to the grace period for the connections to drain
//! 4. force-close whatever is left

use crate::router::{Request, Response, RouteTable, text};
use crate::{Error, Result};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

// Bound on waiting for force-closed connections to let go of their guards
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Counts open connections so shutdown can wait for them.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    active: AtomicU64,
    accepting: AtomicBool,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                active: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a connection.
    ///
    /// Returns None once [`stop_accepting`](Self::stop_accepting) was called.
    pub fn track(&self) -> Option<ConnectionGuard> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return None;
        }

        self.inner.active.fetch_add(1, Ordering::SeqCst);
        Some(ConnectionGuard {
            tracker: self.clone(),
        })
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Wait for all connections to close.
    ///
    /// Returns true if drained within `timeout`, false otherwise.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };

        // tokio clamps oversized timeouts to a far-future deadline
        if tokio::time::timeout(timeout, idle).await.is_ok() {
            return true;
        }

        let active = self.active_count();
        if active == 0 {
            return true;
        }
        warn!(active, "Connection drain timeout reached");
        false
    }

    fn release(&self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection counted until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

/// A bound, not yet serving, HTTP listener.
#[derive(Debug)]
pub struct HttpServer {
    listener: Listener,
    local_addr: SocketAddr,
}

#[derive(Debug)]
enum Listener {
    Tcp(TcpListener),
    /// Every accept fails with this kind
    #[cfg(test)]
    Failing(io::ErrorKind),
}

impl Listener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match self {
            Listener::Tcp(listener) => listener.accept().await,
            #[cfg(test)]
            Listener::Failing(kind) => Err(io::Error::from(*kind)),
        }
    }
}

impl HttpServer {
    /// Bind `host:port`. Port 0 asks the OS for an ephemeral port.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let bind_error = |source| Error::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind((host, port)).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        debug!(%local_addr, "Listener bound");
        Ok(Self {
            listener: Listener::Tcp(listener),
            local_addr,
        })
    }

    /// Swap the socket for one whose accepts always fail with `kind`.
    #[cfg(test)]
    pub(crate) fn failing_accepts(self, kind: io::ErrorKind) -> Self {
        Self {
            listener: Listener::Failing(kind),
            local_addr: self.local_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections in a background task.
    ///
    /// The accept task and every connection task inherit the caller's span.
    pub fn serve(self, routes: Arc<RouteTable>) -> ServerHandle {
        let tracker = ConnectionTracker::new();
        let tokens = ShutdownTokens::default();

        info!(addr = %self.local_addr, "Server listening");

        let accept = tokio::spawn(
            accept_loop(self.listener, routes, tracker.clone(), tokens.clone())
                .instrument(Span::current()),
        );

        ServerHandle {
            local_addr: self.local_addr,
            tracker,
            tokens,
            accept: Some(accept),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ShutdownTokens {
    stop_accepting: CancellationToken,
    graceful: CancellationToken,
    force: CancellationToken,
}

/// Control over a serving [`HttpServer`].
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    tracker: ConnectionTracker,
    tokens: ShutdownTokens,
    accept: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Resolve when the accept loop ends on its own, which only happens on a
    /// fatal accept error. Cancel safe.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.accept.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.accept = None;
        flatten(result)
    }

    /// Stop the server, giving in-flight requests up to `grace` to finish.
    ///
    /// Returns true when every connection closed on its own.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.tokens.stop_accepting.cancel();
        self.tracker.stop_accepting();

        if let Some(task) = self.accept.take() {
            if let Err(e) = flatten(task.await) {
                warn!(error = %e, "Accept loop had already failed");
            }
        }

        debug!(
            active = self.tracker.active_count(),
            "Closing connections gracefully"
        );
        self.tokens.graceful.cancel();

        let drained = self.tracker.drain(grace).await;
        if !drained {
            warn!(
                active = self.tracker.active_count(),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, forcing connections closed"
            );
            self.tokens.force.cancel();
            self.tracker.drain(FORCE_CLOSE_WAIT).await;
        }

        info!(addr = %self.local_addr, drained, "Server stopped");
        drained
    }
}

fn flatten(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(result) => result,
        Err(e) => Err(Error::Serve(io::Error::other(e))),
    }
}

async fn accept_loop(
    listener: Listener,
    routes: Arc<RouteTable>,
    tracker: ConnectionTracker,
    tokens: ShutdownTokens,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = tokens.stop_accepting.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Some(guard) = tracker.track() else {
                    return Ok(());
                };
                tokio::spawn(
                    serve_connection(stream, peer, routes.clone(), guard, tokens.clone())
                        .instrument(Span::current()),
                );
            }
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Skipping failed accept");
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                return Err(Error::Serve(e));
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    routes: Arc<RouteTable>,
    _guard: ConnectionGuard,
    tokens: ShutdownTokens,
) {
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let routes = routes.clone();
        async move { Ok::<_, Infallible>(handle_request(req, &routes).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = tokens.graceful.cancelled() => {
            conn.as_mut().graceful_shutdown();
            tokio::select! {
                result = conn.as_mut() => result,
                _ = tokens.force.cancelled() => {
                    debug!(%peer, "Connection force-closed");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "Connection ended with error");
    }
}

async fn handle_request(req: hyper::Request<Incoming>, routes: &RouteTable) -> Response {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return text(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {e}"),
            );
        }
    };

    let mut request = Request::new(parts.method, parts.uri);
    request.headers = parts.headers;
    request.body = body;

    routes.dispatch(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;

    fn routes(router: &Router) -> Arc<RouteTable> {
        Arc::new(router.build().unwrap())
    }

    #[tokio::test]
    async fn test_tracker_counts_guards() {
        let tracker = ConnectionTracker::new();
        let a = tracker.track().unwrap();
        let b = tracker.track().unwrap();
        assert_eq!(tracker.active_count(), 2);

        drop(a);
        assert_eq!(tracker.active_count(), 1);
        drop(b);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_tracker_refuses_after_stop() {
        let tracker = ConnectionTracker::new();
        tracker.stop_accepting();

        assert!(!tracker.is_accepting());
        assert!(tracker.track().is_none());
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_wakes_on_last_release() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(tracker.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let tracker = ConnectionTracker::new();
        let _guard = tracker.track().unwrap();

        assert!(!tracker.drain(Duration::from_millis(50)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_with_unbounded_timeout() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.drain(Duration::MAX).await);

        let guard = tracker.track().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(guard);
        });
        assert!(tracker.drain(Duration::MAX).await);
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let server = HttpServer::bind("127.0.0.1", 0).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = HttpServer::bind("127.0.0.1", 0).await.unwrap();
        let port = first.local_addr().port();

        let err = HttpServer::bind("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn test_serves_routes() {
        let mut router = Router::new();
        router.get("/ping", |_req| async { text(StatusCode::OK, "pong") });

        let server = HttpServer::bind("127.0.0.1", 0).await.unwrap();
        let handle = server.serve(routes(&router));

        let url = format!("http://{}/ping", handle.local_addr());
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "pong");

        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_request_finish() {
        let mut router = Router::new();
        router.get("/slow", |_req| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            text(StatusCode::OK, "done")
        });

        let server = HttpServer::bind("127.0.0.1", 0).await.unwrap();
        let handle = server.serve(routes(&router));
        let url = format!("http://{}/slow", handle.local_addr());

        let request = tokio::spawn(async move { reqwest::get(&url).await?.text().await });

        while handle.active_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(handle.shutdown(Duration::from_secs(5)).await);
        assert_eq!(request.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_shutdown_forces_stuck_connections() {
        let mut router = Router::new();
        router.get("/stuck", |_req| async {
            std::future::pending::<()>().await;
            text(StatusCode::OK, "never")
        });

        let server = HttpServer::bind("127.0.0.1", 0).await.unwrap();
        let handle = server.serve(routes(&router));
        let url = format!("http://{}/stuck", handle.local_addr());

        let request = tokio::spawn(async move { reqwest::get(&url).await });

        while handle.active_connections() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        assert!(!handle.shutdown(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(request.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_accept_failure_ends_serving() {
        let server = HttpServer::bind("127.0.0.1", 0)
            .await
            .unwrap()
            .failing_accepts(io::ErrorKind::InvalidInput);
        let mut handle = server.serve(routes(&Router::new()));

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::Serve(e) if e.kind() == io::ErrorKind::InvalidInput));

        // Shutting down after the failure still completes.
        assert!(handle.shutdown(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_no_connections_after_shutdown() {
        let server = HttpServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr();
        let handle = server.serve(routes(&Router::new()));

        handle.shutdown(Duration::from_millis(100)).await;

        let result = reqwest::get(format!("http://{addr}/")).await;
        assert!(result.is_err());
    }
}
