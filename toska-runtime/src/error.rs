// Error types for the mesh service runtime

use thiserror::Error;
use toska_discovery::DiscoveryError;

/// Errors returned to the embedding application.
///
/// Only failures that stop the service from running end up here. Registry
/// trouble after startup is logged and never surfaces as an `Error`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to discovery at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("Serving failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("Invalid route: {0}")]
    Route(String),

    #[error("Service has already been started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, Error>;
