// ToskaMesh - runtime SDK for services joining the mesh
//
// Registration with the discovery registry, heartbeats, a local health
// endpoint and ordered deregistration on shutdown.

// Re-export the runtime
pub use toska_runtime::*;

// Re-export the registry client and process configuration crates
pub use toska_config;
pub use toska_discovery;

pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::CancellationToken;
    pub use toska_config::{EnvLoader, ProcessConfig};
    pub use toska_runtime::{
        Error, LoadBalancingStrategy, LogConfig, LogFormat, MeshOption, MeshService, Method,
        Request, Response, Result, Scheme, StatusCode, json, text,
    };
}
