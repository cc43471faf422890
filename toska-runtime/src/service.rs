//! The mesh service lifecycle.
//!
//! A [`MeshService`] walks once through `NotStarted → Binding → Registering →
//! Serving → ShuttingDown → Deregistering → Stopped`.
//! Registering and Deregistering are skipped when auto-registration is off.
//!
//! Shutdown runs in a fixed order, every step bounded and best effort:
//!
//! 1. stop the heartbeat and wait until no report is in flight
//! 2. report `Degraded` to the registry
//! 3. deregister
//! 4. stop the HTTP server, letting in-flight requests finish within the grace period
//! 5. wait for the heartbeat task to exit
//! 6. close the registry connection
//!
//! Because the heartbeat is fenced before the degraded report, no healthy
//! report can start once deregistration has begun.

use crate::health::{HealthPayload, health_handler};
use crate::heartbeat::{HeartbeatHandle, HeartbeatLoop};
use crate::metadata::build_metadata;
use crate::options::{MeshOption, ServiceConfig, resolve};
use crate::router::{Request, Response, RouteTable, Router};
use crate::server::HttpServer;
use crate::{Error, Result};
use http::Method;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use toska_discovery::{
    GrpcConnector, HealthCheckConfig, HealthState, RegistryClient, RegistryConnector,
    ServiceRegistration,
};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

const DEPARTURE_NOTE: &str = "shutting down";

/// Where a [`MeshService`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    NotStarted,
    Binding,
    Registering,
    Serving,
    ShuttingDown,
    Deregistering,
    Stopped,
}

/// Outcome of the registration attempt made at startup.
///
/// None of these stop the service from serving.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    /// Auto-registration is off, or startup has not got that far
    #[default]
    NotAttempted,
    Registered { service_id: String },
    /// The registry answered and refused the instance
    Rejected(String),
    /// The call failed before the registry could answer
    Failed(String),
    TimedOut,
}

impl RegistrationStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Registered { .. })
    }
}

/// A service instance taking part in the mesh.
pub struct MeshService {
    config: ServiceConfig,
    router: Router,
    connector: Arc<dyn RegistryConnector>,
    span: Span,
    addr: Mutex<Option<SocketAddr>>,
    state: watch::Sender<LifecycleState>,
    registration: Mutex<RegistrationStatus>,
    started: AtomicBool,
    #[cfg(test)]
    accept_fault: Option<std::io::ErrorKind>,
}

impl MeshService {
    /// Resolve `options` over the defaults and create the service.
    ///
    /// Fails with [`Error::InvalidConfiguration`] when the service name ends
    /// up empty.
    pub fn new<I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = MeshOption>,
    {
        Ok(Self::from_config(resolve(options)?))
    }

    /// Create a service from an already resolved configuration.
    pub fn from_config(config: ServiceConfig) -> Self {
        let span = info_span!(
            "mesh_service",
            service = %config.identity.service_name,
            id = %config.identity.service_id,
        );
        let (state, _) = watch::channel(LifecycleState::NotStarted);

        Self {
            config,
            router: Router::new(),
            connector: Arc::new(GrpcConnector::new()),
            span,
            addr: Mutex::new(None),
            state,
            registration: Mutex::new(RegistrationStatus::NotAttempted),
            started: AtomicBool::new(false),
            #[cfg(test)]
            accept_fault: None,
        }
    }

    /// Use another way of reaching the registry.
    pub fn with_connector(mut self, connector: impl RegistryConnector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Emit every log line of this instance inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn route<F, Fut>(
        &mut self,
        method: Method,
        path: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.router.route(method, path, handler);
        self
    }

    pub fn get<F, Fut>(&mut self, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.router.get(path, handler);
        self
    }

    pub fn post<F, Fut>(&mut self, path: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        self.router.post(path, handler);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Address the listener is bound to, once bound.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until the lifecycle reached `target` or went past it.
    pub async fn wait_for_state(&self, target: LifecycleState) -> LifecycleState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| *state >= target).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub fn registration(&self) -> RegistrationStatus {
        self.registration.lock().clone()
    }

    /// Run the lifecycle until `token` is cancelled or serving fails.
    ///
    /// Returns an error for a bind failure, a failure to reach the registry
    /// at startup, or a serving failure. Registry trouble after startup is
    /// only logged.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        self.lifecycle(token).instrument(self.span.clone()).await
    }

    /// Like [`start`](Self::start), additionally cancelling `token` on
    /// SIGINT or SIGTERM.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let signals = tokio::spawn(
            forward_shutdown_signal(token.clone()).instrument(self.span.clone()),
        );
        let result = self.start(token).await;
        signals.abort();
        result
    }

    async fn lifecycle(&self, token: CancellationToken) -> Result<()> {
        let identity = &self.config.identity;
        let routes = match self.route_table() {
            Ok(routes) => Arc::new(routes),
            Err(e) => {
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };

        self.set_state(LifecycleState::Binding);
        let server = match HttpServer::bind(&identity.bind_address, identity.port).await {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "Failed to bind listener");
                self.set_state(LifecycleState::Stopped);
                return Err(e);
            }
        };
        #[cfg(test)]
        let server = match self.accept_fault {
            Some(kind) => server.failing_accepts(kind),
            None => server,
        };
        let local_addr = server.local_addr();
        *self.addr.lock() = Some(local_addr);

        let client = if self.config.auto_register || self.config.heartbeat_enabled {
            match self.connector.connect(&self.config.discovery_address).await {
                Ok(client) => Some(client),
                Err(source) => {
                    error!(
                        discovery_address = %self.config.discovery_address,
                        error = %source,
                        "Failed to connect to discovery"
                    );
                    drop(server);
                    self.set_state(LifecycleState::Stopped);
                    return Err(Error::Connect {
                        address: self.config.discovery_address.clone(),
                        source,
                    });
                }
            }
        } else {
            None
        };

        let registry = client.as_ref().filter(|_| self.config.auto_register);

        if let Some(client) = registry {
            self.set_state(LifecycleState::Registering);
            let registration = build_registration(&self.config, local_addr.port());
            let status = self.register(client.as_ref(), &registration, &token).await;
            *self.registration.lock() = status;
        }

        let mut server = server.serve(routes);
        let heartbeat = registry
            .filter(|_| self.config.heartbeat_enabled)
            .map(|client| self.spawn_heartbeat(client.clone()));

        self.set_state(LifecycleState::Serving);
        info!(addr = %local_addr, "Service started");

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }
            result = server.wait() => {
                if let Err(e) = &result {
                    error!(error = %e, "Serving stopped unexpectedly");
                }
                result
            }
        };

        self.set_state(LifecycleState::ShuttingDown);

        if let Some(heartbeat) = &heartbeat {
            heartbeat.fence().await;
        }

        if let Some(client) = registry {
            self.set_state(LifecycleState::Deregistering);
            self.announce_departure(client.as_ref()).await;
            self.deregister(client.as_ref()).await;
        }

        server.shutdown(self.config.timeouts.shutdown_grace).await;

        if let Some(heartbeat) = heartbeat {
            let sent = heartbeat.join().await;
            debug!(sent, "Heartbeat finished");
        }

        if let Some(client) = client {
            client.close().await;
            debug!("Registry connection closed");
        }

        self.set_state(LifecycleState::Stopped);
        info!("Service stopped");
        outcome
    }

    fn route_table(&self) -> Result<RouteTable> {
        let identity = &self.config.identity;
        let mut router = self.router.clone();
        router.insert(
            Method::GET,
            self.config.health.endpoint_path.clone(),
            health_handler(HealthPayload::healthy(
                &identity.service_name,
                &identity.service_id,
            )),
        );
        router.build()
    }

    fn spawn_heartbeat(&self, client: Arc<dyn RegistryClient>) -> HeartbeatHandle {
        HeartbeatLoop::new(
            client,
            &self.config.identity.service_id,
            self.config.health.probe_interval,
            self.config.timeouts.registry_call,
        )
        .spawn()
    }

    async fn register(
        &self,
        client: &dyn RegistryClient,
        registration: &ServiceRegistration,
        token: &CancellationToken,
    ) -> RegistrationStatus {
        let timeout = self.config.timeouts.registry_call;
        let call = tokio::time::timeout(timeout, client.register(registration));

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!("Registration abandoned, shutdown requested");
                return RegistrationStatus::Failed("cancelled".to_string());
            }
            outcome = call => outcome,
        };

        match outcome {
            Ok(Ok(ack)) if ack.success => {
                info!(
                    service_id = %ack.service_id,
                    authority = %registration.authority(),
                    "Registered with discovery"
                );
                RegistrationStatus::Registered {
                    service_id: ack.service_id,
                }
            }
            Ok(Ok(ack)) => {
                let reason = ack.error_message.unwrap_or_default();
                error!(reason = %reason, "Registration rejected by discovery");
                RegistrationStatus::Rejected(reason)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Registration failed");
                RegistrationStatus::Failed(e.to_string())
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Registration timed out");
                RegistrationStatus::TimedOut
            }
        }
    }

    async fn announce_departure(&self, client: &dyn RegistryClient) {
        let timeout = self.config.timeouts.registry_call;
        let report = client.report_health(
            &self.config.identity.service_id,
            HealthState::Degraded,
            DEPARTURE_NOTE,
        );

        match tokio::time::timeout(timeout, report).await {
            Ok(Ok(true)) => info!("Reported degraded status"),
            Ok(Ok(false)) => warn!("Degraded status not acknowledged"),
            Ok(Err(e)) => warn!(error = %e, "Failed to report degraded status"),
            Err(_) => warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Degraded status report timed out"
            ),
        }
    }

    async fn deregister(&self, client: &dyn RegistryClient) {
        let timeout = self.config.timeouts.registry_call;
        let service_id = &self.config.identity.service_id;

        match tokio::time::timeout(timeout, client.deregister(service_id)).await {
            Ok(Ok(true)) => info!("Deregistered from discovery"),
            Ok(Ok(false)) => warn!("Discovery had no record of this instance"),
            Ok(Err(e)) => warn!(error = %e, "Failed to deregister"),
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Deregistration timed out"),
        }
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        debug!(from = ?previous, to = ?state, "Lifecycle transition");
    }
}

/// The registration sent for `config` once the listener is bound to `port`.
///
/// Metadata is computed here, from the configuration as it is now.
pub fn build_registration(config: &ServiceConfig, port: u16) -> ServiceRegistration {
    ServiceRegistration {
        service_name: config.identity.service_name.clone(),
        service_id: config.identity.service_id.clone(),
        address: config.identity.advertised_address.clone(),
        port,
        metadata: build_metadata(&config.metadata, &config.routing),
        health_check: HealthCheckConfig {
            endpoint: config.health.endpoint_path.clone(),
            interval: config.health.probe_interval,
            timeout: config.health.probe_timeout,
            unhealthy_threshold: config.health.unhealthy_threshold,
        },
    }
}

async fn forward_shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = shutdown_signal() => token.cancel(),
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, starting graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, starting graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, starting graceful shutdown"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}
