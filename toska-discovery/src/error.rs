//! Discovery client error types.

use thiserror::Error;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors returned by a registry client.
///
/// An explicit rejection of a registration is not an error: it comes back as a
/// [`RegistrationAck`](crate::RegistrationAck) with `success == false`.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery address could not be turned into an endpoint.
    #[error("Invalid discovery address: {0}")]
    InvalidAddress(String),

    /// Transport-level failure of the underlying channel.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The remote answered the call with a non-OK status.
    #[error("gRPC status: {0}")]
    Status(#[from] tonic::Status),

    /// The registry could not be reached.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// The connection was released before the call was made.
    #[error("Registry connection closed")]
    ConnectionClosed,
}

impl DiscoveryError {
    /// Returns true if the call never got an application-level answer.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Unavailable(_) | Self::ConnectionClosed => true,
            Self::Status(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Cancelled
            ),
            Self::InvalidAddress(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(DiscoveryError::Unavailable("down".into()).is_transport());
        assert!(DiscoveryError::ConnectionClosed.is_transport());
        assert!(DiscoveryError::Status(tonic::Status::unavailable("no route")).is_transport());
        assert!(!DiscoveryError::Status(tonic::Status::invalid_argument("bad")).is_transport());
        assert!(!DiscoveryError::InvalidAddress("::".into()).is_transport());
    }
}
