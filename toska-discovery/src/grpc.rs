//! gRPC registry client.

use crate::proto::{self, DiscoveryRegistryClient};
use crate::{
    DiscoveryError, HealthState, RegistrationAck, RegistryClient, RegistryConnector, Result,
    ServiceRegistration,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Endpoint;
use tracing::{debug, info};

/// Connector that opens lazy gRPC channels to the discovery service.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl GrpcConnector {
    /// Create a connector with default settings
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }

    /// Set the TCP connect timeout used when the channel first dials out
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable TCP nodelay
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.tcp_nodelay = enable;
        self
    }

    fn endpoint(&self, discovery_address: &str) -> Result<Endpoint> {
        let uri = if discovery_address.contains("://") {
            discovery_address.to_string()
        } else {
            format!("http://{discovery_address}")
        };

        Ok(Endpoint::from_shared(uri)
            .map_err(|e| DiscoveryError::InvalidAddress(format!("{discovery_address}: {e}")))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(self.tcp_nodelay))
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryConnector for GrpcConnector {
    async fn connect(&self, discovery_address: &str) -> Result<Arc<dyn RegistryClient>> {
        info!(endpoint = %discovery_address, "Creating lazy discovery channel");

        let channel = self.endpoint(discovery_address)?.connect_lazy();

        Ok(Arc::new(GrpcRegistryClient {
            client: Mutex::new(Some(DiscoveryRegistryClient::new(channel))),
        }))
    }
}

/// Registry client speaking the `DiscoveryRegistry` gRPC service.
pub struct GrpcRegistryClient {
    client: Mutex<Option<DiscoveryRegistryClient>>,
}

impl GrpcRegistryClient {
    // tonic clients are cheap handles over a shared channel; each call works on its own clone.
    fn client(&self) -> Result<DiscoveryRegistryClient> {
        self.client
            .lock()
            .as_ref()
            .cloned()
            .ok_or(DiscoveryError::ConnectionClosed)
    }
}

fn wire_status(state: HealthState) -> proto::HealthStatus {
    match state {
        HealthState::Healthy => proto::HealthStatus::Healthy,
        HealthState::Degraded => proto::HealthStatus::Degraded,
    }
}

fn whole_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl RegistryClient for GrpcRegistryClient {
    async fn register(&self, registration: &ServiceRegistration) -> Result<RegistrationAck> {
        let health = &registration.health_check;
        let request = proto::RegisterServiceRequest {
            service_name: registration.service_name.clone(),
            service_id: registration.service_id.clone(),
            address: registration.address.clone(),
            port: i32::from(registration.port),
            metadata: registration.metadata.clone(),
            health_check: Some(proto::HealthCheckConfig {
                endpoint: health.endpoint.clone(),
                interval_seconds: whole_seconds(health.interval),
                timeout_seconds: whole_seconds(health.timeout),
                unhealthy_threshold: i32::try_from(health.unhealthy_threshold).unwrap_or(i32::MAX),
            }),
        };

        let response = self.client()?.register(request).await?;

        debug!(service_id = %response.service_id, success = response.success, "Register answered");

        Ok(RegistrationAck {
            service_id: response.service_id,
            success: response.success,
            error_message: (!response.error_message.is_empty()).then_some(response.error_message),
        })
    }

    async fn report_health(
        &self,
        service_id: &str,
        state: HealthState,
        note: &str,
    ) -> Result<bool> {
        let request = proto::ReportHealthRequest {
            service_id: service_id.to_string(),
            status: wire_status(state) as i32,
            output: note.to_string(),
        };

        let response = self.client()?.report_health(request).await?;
        Ok(response.acknowledged)
    }

    async fn deregister(&self, service_id: &str) -> Result<bool> {
        let request = proto::DeregisterServiceRequest {
            service_id: service_id.to_string(),
        };

        let response = self.client()?.deregister(request).await?;
        Ok(response.removed)
    }

    async fn close(&self) {
        if self.client.lock().take().is_some() {
            debug!("Discovery channel released");
        }
    }
}
