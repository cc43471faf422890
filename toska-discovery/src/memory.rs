//! In-memory registry (for testing)

use crate::{
    DiscoveryError, HealthState, RegistrationAck, RegistryClient, RegistryConnector, Result,
    ServiceRegistration,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A registry operation observed by [`InMemoryRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Register { service_id: String, port: u16 },
    ReportHealth { service_id: String, state: HealthState },
    Deregister { service_id: String },
    Close,
}

/// Whether a call record marks the start or the end of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Started,
    Finished,
}

/// One entry of the call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call: RegistryCall,
    pub phase: CallPhase,
}

/// How the registry answers `register`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegisterBehavior {
    /// Store the instance and acknowledge it
    #[default]
    Accept,
    /// Answer with `success == false` and the given reason
    Reject(String),
    /// Fail the call with a transport error
    Unavailable,
}

#[derive(Default)]
struct State {
    services: HashMap<String, ServiceRegistration>,
    health: HashMap<String, HealthState>,
    log: Vec<CallRecord>,
    register_behavior: RegisterBehavior,
    fail_heartbeats: bool,
    refuse_connections: bool,
    heartbeat_latency: Duration,
    connections_closed: usize,
}

/// In-memory discovery registry (for testing/development).
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl InMemoryRegistry {
    /// Create new in-memory registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how `register` answers from now on
    pub fn set_register_behavior(&self, behavior: RegisterBehavior) {
        self.state.lock().register_behavior = behavior;
    }

    /// Fail healthy reports with a transport error
    pub fn fail_heartbeats(&self, fail: bool) {
        self.state.lock().fail_heartbeats = fail;
    }

    /// Make `connect` fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Delay every healthy report by `latency`
    pub fn set_heartbeat_latency(&self, latency: Duration) {
        self.state.lock().heartbeat_latency = latency;
    }

    /// Get count of registered services
    pub fn count(&self) -> usize {
        self.state.lock().services.len()
    }

    /// Get a registered instance
    pub fn get(&self, service_id: &str) -> Option<ServiceRegistration> {
        self.state.lock().services.get(service_id).cloned()
    }

    /// Last health state reported for an instance
    pub fn health_of(&self, service_id: &str) -> Option<HealthState> {
        self.state.lock().health.get(service_id).copied()
    }

    /// Every call seen so far, in order
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().log.clone()
    }

    /// Number of healthy reports that started
    pub fn heartbeats_started(&self) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| {
                r.phase == CallPhase::Started
                    && matches!(
                        r.call,
                        RegistryCall::ReportHealth {
                            state: HealthState::Healthy,
                            ..
                        }
                    )
            })
            .count()
    }

    /// Number of connections released
    pub fn connections_closed(&self) -> usize {
        self.state.lock().connections_closed
    }

    /// Clear all registered services and the call log
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.services.clear();
        state.health.clear();
        state.log.clear();
    }

    fn record(&self, call: RegistryCall, phase: CallPhase) {
        self.state.lock().log.push(CallRecord { call, phase });
    }
}

#[async_trait]
impl RegistryConnector for InMemoryRegistry {
    async fn connect(&self, discovery_address: &str) -> Result<Arc<dyn RegistryClient>> {
        if self.state.lock().refuse_connections {
            return Err(DiscoveryError::Unavailable(format!(
                "connection to {discovery_address} refused"
            )));
        }

        Ok(Arc::new(InMemoryConnection {
            registry: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection handed out by [`InMemoryRegistry`].
pub struct InMemoryConnection {
    registry: InMemoryRegistry,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DiscoveryError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RegistryClient for InMemoryConnection {
    async fn register(&self, registration: &ServiceRegistration) -> Result<RegistrationAck> {
        self.ensure_open()?;
        let call = RegistryCall::Register {
            service_id: registration.service_id.clone(),
            port: registration.port,
        };
        self.registry.record(call.clone(), CallPhase::Started);

        let result = {
            let mut state = self.registry.state.lock();
            match state.register_behavior.clone() {
                RegisterBehavior::Accept => {
                    state
                        .services
                        .insert(registration.service_id.clone(), registration.clone());
                    Ok(RegistrationAck::accepted(&registration.service_id))
                }
                RegisterBehavior::Reject(reason) => {
                    Ok(RegistrationAck::rejected(&registration.service_id, reason))
                }
                RegisterBehavior::Unavailable => {
                    Err(DiscoveryError::Unavailable("registry unreachable".to_string()))
                }
            }
        };

        self.registry.record(call, CallPhase::Finished);
        result
    }

    async fn report_health(
        &self,
        service_id: &str,
        state: HealthState,
        _note: &str,
    ) -> Result<bool> {
        self.ensure_open()?;
        let call = RegistryCall::ReportHealth {
            service_id: service_id.to_string(),
            state,
        };
        self.registry.record(call.clone(), CallPhase::Started);

        let (latency, fail) = {
            let inner = self.registry.state.lock();
            match state {
                HealthState::Healthy => (inner.heartbeat_latency, inner.fail_heartbeats),
                HealthState::Degraded => (Duration::ZERO, false),
            }
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = if fail {
            Err(DiscoveryError::Unavailable("heartbeat dropped".to_string()))
        } else {
            let mut inner = self.registry.state.lock();
            let known = inner.services.contains_key(service_id);
            if known {
                inner.health.insert(service_id.to_string(), state);
            }
            Ok(known)
        };

        self.registry.record(call, CallPhase::Finished);
        result
    }

    async fn deregister(&self, service_id: &str) -> Result<bool> {
        self.ensure_open()?;
        let call = RegistryCall::Deregister {
            service_id: service_id.to_string(),
        };
        self.registry.record(call.clone(), CallPhase::Started);

        let removed = {
            let mut state = self.registry.state.lock();
            state.health.remove(service_id);
            state.services.remove(service_id).is_some()
        };

        self.registry.record(call, CallPhase::Finished);
        Ok(removed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.registry.state.lock().connections_closed += 1;
            self.registry.record(RegistryCall::Close, CallPhase::Finished);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HealthCheckConfig;

    fn registration(id: &str) -> ServiceRegistration {
        ServiceRegistration {
            service_name: "api".to_string(),
            service_id: id.to_string(),
            address: "localhost".to_string(),
            port: 8080,
            metadata: HashMap::new(),
            health_check: HealthCheckConfig {
                endpoint: "/health".to_string(),
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
                unhealthy_threshold: 3,
            },
        }
    }

    #[tokio::test]
    async fn test_in_memory_registry() {
        let registry = InMemoryRegistry::new();
        let client = registry.connect("memory").await.unwrap();

        // Register
        let ack = client.register(&registration("svc-1")).await.unwrap();
        assert!(ack.success);
        assert_eq!(registry.count(), 1);

        // Heartbeat
        let acknowledged = client
            .report_health("svc-1", HealthState::Healthy, "heartbeat")
            .await
            .unwrap();
        assert!(acknowledged);
        assert_eq!(registry.health_of("svc-1"), Some(HealthState::Healthy));

        // Deregister
        assert!(client.deregister("svc-1").await.unwrap());
        assert_eq!(registry.count(), 0);
        assert!(!client.deregister("svc-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let registry = InMemoryRegistry::new();
        registry.set_register_behavior(RegisterBehavior::Reject("duplicate".to_string()));
        let client = registry.connect("memory").await.unwrap();

        let ack = client.register(&registration("svc-1")).await.unwrap();
        assert!(!ack.success);
        assert_eq!(ack.error_message.as_deref(), Some("duplicate"));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_registration() {
        let registry = InMemoryRegistry::new();
        registry.set_register_behavior(RegisterBehavior::Unavailable);
        let client = registry.connect("memory").await.unwrap();

        let err = client.register(&registration("svc-1")).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_failed_heartbeats_only_affect_healthy_reports() {
        let registry = InMemoryRegistry::new();
        registry.fail_heartbeats(true);
        let client = registry.connect("memory").await.unwrap();
        client.register(&registration("svc-1")).await.unwrap();

        assert!(client
            .report_health("svc-1", HealthState::Healthy, "heartbeat")
            .await
            .is_err());
        assert!(client
            .report_health("svc-1", HealthState::Degraded, "shutting down")
            .await
            .unwrap());
        assert_eq!(registry.heartbeats_started(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = InMemoryRegistry::new();
        let client = registry.connect("memory").await.unwrap();

        client.close().await;
        client.close().await;

        assert_eq!(registry.connections_closed(), 1);
        assert!(matches!(
            client.deregister("svc-1").await,
            Err(DiscoveryError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let registry = InMemoryRegistry::new();
        registry.refuse_connections(true);

        assert!(registry.connect("memory").await.is_err());
    }

    #[tokio::test]
    async fn test_call_log_order() {
        let registry = InMemoryRegistry::new();
        let client = registry.connect("memory").await.unwrap();
        client.register(&registration("svc-1")).await.unwrap();
        client.deregister("svc-1").await.unwrap();

        let calls: Vec<_> = registry
            .calls()
            .into_iter()
            .filter(|r| r.phase == CallPhase::Started)
            .map(|r| r.call)
            .collect();
        assert_eq!(
            calls,
            vec![
                RegistryCall::Register {
                    service_id: "svc-1".to_string(),
                    port: 8080
                },
                RegistryCall::Deregister {
                    service_id: "svc-1".to_string()
                },
            ]
        );
    }
}
