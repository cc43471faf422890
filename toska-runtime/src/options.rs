//! Service configuration and its resolution.
//!
//! Configuration is expressed as an ordered list of [`MeshOption`]s applied
//! to a defaults record. Later options win. Once every option ran, the
//! derived fields are filled in and the result is frozen into a
//! [`ServiceConfig`].
//!
//! ```
//! use toska_runtime::options::{resolve, LoadBalancingStrategy, MeshOption};
//!
//! let config = resolve([
//!     MeshOption::service_name("orders"),
//!     MeshOption::port(0),
//!     MeshOption::routing_strategy(LoadBalancingStrategy::LeastConnections),
//! ])
//! .unwrap();
//!
//! assert_eq!(config.identity.service_name, "orders");
//! assert_eq!(config.identity.advertised_address, "0.0.0.0");
//! assert!(config.identity.service_id.starts_with("orders-"));
//! ```

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How the mesh gateway distributes traffic over instances of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    WeightedRoundRobin,
    IpHash,
}

impl LoadBalancingStrategy {
    /// Name advertised to the registry
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "RoundRobin",
            LoadBalancingStrategy::LeastConnections => "LeastConnections",
            LoadBalancingStrategy::Random => "Random",
            LoadBalancingStrategy::WeightedRoundRobin => "WeightedRoundRobin",
            LoadBalancingStrategy::IpHash => "IPHash",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RoundRobin" => Ok(LoadBalancingStrategy::RoundRobin),
            "LeastConnections" => Ok(LoadBalancingStrategy::LeastConnections),
            "Random" => Ok(LoadBalancingStrategy::Random),
            "WeightedRoundRobin" => Ok(LoadBalancingStrategy::WeightedRoundRobin),
            "IPHash" => Ok(LoadBalancingStrategy::IpHash),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown load balancing strategy: {other}"
            ))),
        }
    }
}

/// URL scheme the gateway uses to reach the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(Error::InvalidConfiguration(format!("unknown scheme: {other}"))),
        }
    }
}

/// Bounded waits used by the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimeouts {
    /// Deadline of every single registry call
    pub registry_call: Duration,
    /// How long in-flight requests may run once shutdown began
    pub shutdown_grace: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self {
            registry_call: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Routing options as set by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingOptions {
    pub scheme: Scheme,
    /// Health path advertised for routing. Defaults to the health endpoint.
    pub health_check_endpoint: Option<String>,
    pub strategy: LoadBalancingStrategy,
    /// Only meaningful under `WeightedRoundRobin`
    pub weight: i32,
}

/// The mutable record options are applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Name registered with discovery. Required.
    pub service_name: String,
    /// Unique instance id. Generated when unset.
    pub service_id: Option<String>,

    /// Bind address
    pub address: String,
    /// Address advertised to discovery. Defaults to `address`.
    pub advertised_address: Option<String>,
    /// Bind port. 0 picks an ephemeral port.
    pub port: u16,

    pub health_endpoint: String,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub unhealthy_threshold: u32,

    pub heartbeat_enabled: bool,
    pub auto_register: bool,

    /// gRPC address of the discovery service
    pub discovery_address: String,

    /// Custom metadata propagated to discovery
    pub metadata: HashMap<String, String>,
    pub routing: RoutingOptions,
    pub timeouts: LifecycleTimeouts,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            service_name: "mesh-service".to_string(),
            service_id: None,
            address: "0.0.0.0".to_string(),
            advertised_address: None,
            port: 8080,
            health_endpoint: "/health".to_string(),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            heartbeat_enabled: true,
            auto_register: true,
            discovery_address: "localhost:8080".to_string(),
            metadata: HashMap::new(),
            routing: RoutingOptions {
                scheme: Scheme::Http,
                health_check_endpoint: None,
                strategy: LoadBalancingStrategy::RoundRobin,
                weight: 1,
            },
            timeouts: LifecycleTimeouts::default(),
        }
    }
}

impl ServiceOptions {
    /// Validate and derive the remaining fields.
    pub fn resolve(self) -> Result<ServiceConfig> {
        if self.service_name.is_empty() {
            return Err(Error::InvalidConfiguration(
                "service name is required".to_string(),
            ));
        }

        let service_id = non_empty(self.service_id)
            .unwrap_or_else(|| format!("{}-{}", self.service_name, unique_timestamp()));
        let advertised_address =
            non_empty(self.advertised_address).unwrap_or_else(|| self.address.clone());
        let health_check_path = non_empty(self.routing.health_check_endpoint)
            .unwrap_or_else(|| self.health_endpoint.clone());

        Ok(ServiceConfig {
            identity: ServiceIdentity {
                service_name: self.service_name,
                service_id,
                bind_address: self.address,
                advertised_address,
                port: self.port,
            },
            health: HealthPolicy {
                endpoint_path: self.health_endpoint,
                probe_interval: self.health_interval,
                probe_timeout: self.health_timeout,
                unhealthy_threshold: self.unhealthy_threshold,
            },
            routing: RoutingAttributes {
                scheme: self.routing.scheme,
                strategy: self.routing.strategy,
                weight: self.routing.weight,
                health_check_path,
            },
            heartbeat_enabled: self.heartbeat_enabled,
            auto_register: self.auto_register,
            discovery_address: self.discovery_address,
            metadata: self.metadata,
            timeouts: self.timeouts,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

// Wall-clock nanoseconds, forced strictly increasing within the process.
fn unique_timestamp() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);

    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Who this instance is and where it listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub service_id: String,
    pub bind_address: String,
    pub advertised_address: String,
    /// Configured port; 0 until the listener resolves it
    pub port: u16,
}

/// Local health endpoint plus the probing parameters advertised to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    pub endpoint_path: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub unhealthy_threshold: u32,
}

/// Routing attributes after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingAttributes {
    pub scheme: Scheme,
    pub strategy: LoadBalancingStrategy,
    pub weight: i32,
    pub health_check_path: String,
}

/// Fully resolved, immutable service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub identity: ServiceIdentity,
    pub health: HealthPolicy,
    pub routing: RoutingAttributes,
    pub heartbeat_enabled: bool,
    pub auto_register: bool,
    pub discovery_address: String,
    pub metadata: HashMap<String, String>,
    pub timeouts: LifecycleTimeouts,
}

/// A single configuration override.
pub struct MeshOption(Box<dyn FnOnce(&mut ServiceOptions) + Send>);

impl MeshOption {
    /// Wrap an arbitrary override
    pub fn new(apply: impl FnOnce(&mut ServiceOptions) + Send + 'static) -> Self {
        Self(Box::new(apply))
    }

    pub fn service_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |o| o.service_name = name)
    }

    pub fn service_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(move |o| o.service_id = Some(id))
    }

    pub fn address(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(move |o| o.address = addr)
    }

    pub fn advertised_address(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(move |o| o.advertised_address = Some(addr))
    }

    pub fn port(port: u16) -> Self {
        Self::new(move |o| o.port = port)
    }

    pub fn health_endpoint(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(move |o| o.health_endpoint = path)
    }

    pub fn health_interval(interval: Duration) -> Self {
        Self::new(move |o| o.health_interval = interval)
    }

    pub fn health_timeout(timeout: Duration) -> Self {
        Self::new(move |o| o.health_timeout = timeout)
    }

    pub fn unhealthy_threshold(threshold: u32) -> Self {
        Self::new(move |o| o.unhealthy_threshold = threshold)
    }

    pub fn heartbeat(enabled: bool) -> Self {
        Self::new(move |o| o.heartbeat_enabled = enabled)
    }

    pub fn auto_register(enabled: bool) -> Self {
        Self::new(move |o| o.auto_register = enabled)
    }

    pub fn discovery_address(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(move |o| o.discovery_address = addr)
    }

    pub fn metadata(key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        Self::new(move |o| {
            o.metadata.insert(key, value);
        })
    }

    pub fn routing_strategy(strategy: LoadBalancingStrategy) -> Self {
        Self::new(move |o| o.routing.strategy = strategy)
    }

    pub fn routing_weight(weight: i32) -> Self {
        Self::new(move |o| o.routing.weight = weight)
    }

    pub fn routing_scheme(scheme: Scheme) -> Self {
        Self::new(move |o| o.routing.scheme = scheme)
    }

    pub fn routing_health_check_endpoint(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(move |o| o.routing.health_check_endpoint = Some(path))
    }

    pub fn registry_call_timeout(timeout: Duration) -> Self {
        Self::new(move |o| o.timeouts.registry_call = timeout)
    }

    pub fn shutdown_grace(grace: Duration) -> Self {
        Self::new(move |o| o.timeouts.shutdown_grace = grace)
    }

    fn apply(self, options: &mut ServiceOptions) {
        (self.0)(options)
    }
}

impl fmt::Debug for MeshOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MeshOption(..)")
    }
}

/// Apply `overrides` in order on top of `base`, then resolve.
pub fn resolve_with<I>(base: ServiceOptions, overrides: I) -> Result<ServiceConfig>
where
    I: IntoIterator<Item = MeshOption>,
{
    let mut options = base;
    for option in overrides {
        option.apply(&mut options);
    }
    options.resolve()
}

/// Apply `overrides` in order on top of the defaults, then resolve.
pub fn resolve<I>(overrides: I) -> Result<ServiceConfig>
where
    I: IntoIterator<Item = MeshOption>,
{
    resolve_with(ServiceOptions::default(), overrides)
}
