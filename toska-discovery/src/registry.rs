//! Registry contract consumed by the service runtime.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Health check parameters advertised to the registry for its own probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Path of the instance's health endpoint
    pub endpoint: String,

    /// Interval between probes
    pub interval: Duration,

    /// Timeout of a single probe
    pub timeout: Duration,

    /// Consecutive failed probes before the instance is considered down
    pub unhealthy_threshold: u32,
}

/// Everything the registry needs to know about one service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Service name
    pub service_name: String,

    /// Service ID (unique per instance)
    pub service_id: String,

    /// Address other mesh participants use to reach the instance
    pub address: String,

    /// Bound port (never 0)
    pub port: u16,

    /// Metadata
    pub metadata: HashMap<String, String>,

    /// Health check parameters
    pub health_check: HealthCheckConfig,
}

impl ServiceRegistration {
    /// Get full service authority (`address:port`)
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Registry answer to a registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAck {
    /// Identifier the registry stored the instance under
    pub service_id: String,

    /// Whether the registry accepted the instance
    pub success: bool,

    /// Reason given by the registry when it did not
    pub error_message: Option<String>,
}

impl RegistrationAck {
    /// An accepted registration
    pub fn accepted(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            success: true,
            error_message: None,
        }
    }

    /// A rejected registration
    pub fn rejected(service_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            success: false,
            error_message: Some(reason.into()),
        }
    }
}

/// Health states an instance reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Serving normally
    Healthy,
    /// Still reachable but leaving
    Degraded,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote operations against the discovery authority.
///
/// Implementations must tolerate `report_health` running concurrently with
/// `deregister`; the runtime never issues more than those two at once.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register a service instance
    async fn register(&self, registration: &ServiceRegistration) -> Result<RegistrationAck>;

    /// Report the health of a registered instance, returns whether the registry acknowledged it
    async fn report_health(&self, service_id: &str, state: HealthState, note: &str) -> Result<bool>;

    /// Deregister a service instance, returns whether an entry was removed
    async fn deregister(&self, service_id: &str) -> Result<bool>;

    /// Release the connection. Calls made afterwards fail with `ConnectionClosed`.
    async fn close(&self) {}
}

/// Opens registry connections.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    /// Establish a connection to the registry at `discovery_address`
    async fn connect(&self, discovery_address: &str) -> Result<Arc<dyn RegistryClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_registration() {
        let registration = ServiceRegistration {
            service_name: "api".to_string(),
            service_id: "api-1".to_string(),
            address: "10.0.0.4".to_string(),
            port: 9090,
            metadata: HashMap::from([("version".to_string(), "1.0.0".to_string())]),
            health_check: HealthCheckConfig {
                endpoint: "/health".to_string(),
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
                unhealthy_threshold: 3,
            },
        };

        assert_eq!(registration.authority(), "10.0.0.4:9090");
        assert_eq!(registration.metadata.get("version").map(String::as_str), Some("1.0.0"));
    }

    #[test]
    fn test_registration_ack() {
        let ack = RegistrationAck::rejected("api-1", "duplicate id");
        assert!(!ack.success);
        assert_eq!(ack.error_message.as_deref(), Some("duplicate id"));

        let ack = RegistrationAck::accepted("api-1");
        assert!(ack.success);
        assert!(ack.error_message.is_none());
    }

    #[test]
    fn test_health_state_display() {
        assert_eq!(HealthState::Healthy.to_string(), "healthy");
        assert_eq!(HealthState::Degraded.to_string(), "degraded");
    }
}
