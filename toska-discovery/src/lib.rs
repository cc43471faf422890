//! Discovery registry client for ToskaMesh
//!
//! This crate defines the contract a mesh service uses to talk to the central
//! discovery authority, together with the implementations shipped with it.
//!
//! ## Features
//!
//! - **Registration** - Register a service instance with its metadata and health check
//! - **Health Reports** - Heartbeats and the degraded signal sent before leaving
//! - **Deregistration** - Remove the instance on shutdown
//! - **Multiple Backends** - gRPC or in-memory
//!
//! ## Quick Start
//!
//! ### In-Memory Registry (Testing)
//!
//! ```rust,ignore
//! use toska_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = InMemoryRegistry::new();
//!     let client = registry.connect("memory").await?;
//!
//!     let ack = client.register(&registration).await?;
//!     client.report_health(&ack.service_id, HealthState::Healthy, "heartbeat").await?;
//!     client.deregister(&ack.service_id).await?;
//!     client.close().await;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### gRPC Registry
//!
//! ```rust,ignore
//! use toska_discovery::*;
//!
//! let client = GrpcConnector::new().connect("localhost:8080").await?;
//! ```

pub mod error;
pub mod grpc;
pub mod memory;
pub mod proto;
pub mod registry;

pub use error::{DiscoveryError, Result};
pub use grpc::{GrpcConnector, GrpcRegistryClient};
pub use memory::{
    CallPhase, CallRecord, InMemoryConnection, InMemoryRegistry, RegisterBehavior, RegistryCall,
};
pub use registry::{
    HealthCheckConfig, HealthState, RegistrationAck, RegistryClient, RegistryConnector,
    ServiceRegistration,
};
