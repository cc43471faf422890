//! Lifecycle runtime for ToskaMesh services
//!
//! Embeds a service instance in the mesh: binds its HTTP endpoint, registers
//! with the discovery registry, reports liveness with periodic heartbeats,
//! serves a local health endpoint and leaves the mesh in order on shutdown.
//!
//! ## Quick Start
//!
//! ```no_run
//! use toska_runtime::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut service = MeshService::new([
//!         MeshOption::service_name("orders"),
//!         MeshOption::port(9090),
//!         MeshOption::discovery_address("discovery:8080"),
//!     ])?;
//!
//!     service.get("/orders", |_req| async { json(StatusCode::OK, &Vec::<String>::new()) });
//!
//!     service.run(CancellationToken::new()).await
//! }
//! ```

pub mod error;
pub mod health;
pub mod heartbeat;
pub mod logging;
pub mod metadata;
pub mod options;
pub mod router;
pub mod server;
pub mod service;

pub use error::{Error, Result};
pub use http::{Method, StatusCode};
pub use health::{HEALTHY, HealthPayload, health_response};
pub use heartbeat::{HeartbeatHandle, HeartbeatLoop};
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};
pub use metadata::build_metadata;
pub use options::{
    HealthPolicy, LifecycleTimeouts, LoadBalancingStrategy, MeshOption, RoutingAttributes,
    RoutingOptions, Scheme, ServiceConfig, ServiceIdentity, ServiceOptions, resolve, resolve_with,
};
pub use router::{HandlerFn, Request, Response, RouteTable, Router, json, text};
pub use server::{ConnectionGuard, ConnectionTracker, HttpServer, ServerHandle};
pub use service::{LifecycleState, MeshService, RegistrationStatus, build_registration};
