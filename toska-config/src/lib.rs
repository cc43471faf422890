//! Process environment configuration for ToskaMesh services
//!
//! Reads the handful of variables a mesh service process is started with:
//!
//! | Variable                 | Default          |
//! |--------------------------|------------------|
//! | `MESH_SERVICE_NAME`      | `hello-mesh`     |
//! | `MESH_SERVICE_PORT`      | `9090`           |
//! | `MESH_DISCOVERY_ADDRESS` | `localhost:8080` |
//!
//! Unset, empty or unparseable values fall back to the default.
//!
//! ```
//! use std::collections::HashMap;
//! use toska_config::{EnvLoader, ProcessConfig};
//!
//! let vars = HashMap::from([("MESH_SERVICE_PORT".to_string(), "7000".to_string())]);
//! let config = ProcessConfig::from_env(&EnvLoader::from_map(None, vars));
//!
//! assert_eq!(config.service_name, "hello-mesh");
//! assert_eq!(config.port, 7000);
//! ```

pub mod env;
pub mod error;

pub use env::{EnvLoader, load_dotenv};
pub use error::{ConfigError, Result};

pub const SERVICE_NAME_VAR: &str = "MESH_SERVICE_NAME";
pub const SERVICE_PORT_VAR: &str = "MESH_SERVICE_PORT";
pub const DISCOVERY_ADDRESS_VAR: &str = "MESH_DISCOVERY_ADDRESS";

pub const DEFAULT_SERVICE_NAME: &str = "hello-mesh";
pub const DEFAULT_SERVICE_PORT: u16 = 9090;
pub const DEFAULT_DISCOVERY_ADDRESS: &str = "localhost:8080";

/// Settings a service process takes from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub service_name: String,
    pub port: u16,
    pub discovery_address: String,
}

impl ProcessConfig {
    pub fn from_env(loader: &EnvLoader) -> Self {
        Self {
            service_name: loader.load_var_or(SERVICE_NAME_VAR, DEFAULT_SERVICE_NAME),
            port: loader.load_parsed_or(SERVICE_PORT_VAR, DEFAULT_SERVICE_PORT),
            discovery_address: loader.load_var_or(DISCOVERY_ADDRESS_VAR, DEFAULT_DISCOVERY_ADDRESS),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            port: DEFAULT_SERVICE_PORT,
            discovery_address: DEFAULT_DISCOVERY_ADDRESS.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> ProcessConfig {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        ProcessConfig::from_env(&EnvLoader::from_map(None, vars))
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(from_vars(&[]), ProcessConfig::default());
    }

    #[test]
    fn test_values_from_env() {
        let config = from_vars(&[
            (SERVICE_NAME_VAR, "orders"),
            (SERVICE_PORT_VAR, "8181"),
            (DISCOVERY_ADDRESS_VAR, "discovery.mesh:50051"),
        ]);

        assert_eq!(config.service_name, "orders");
        assert_eq!(config.port, 8181);
        assert_eq!(config.discovery_address, "discovery.mesh:50051");
    }

    #[test]
    fn test_bad_port_falls_back() {
        for port in ["", "http", "-1", "65536"] {
            assert_eq!(
                from_vars(&[(SERVICE_PORT_VAR, port)]).port,
                DEFAULT_SERVICE_PORT,
                "port {port:?}"
            );
        }
    }

    #[test]
    fn test_empty_name_falls_back() {
        assert_eq!(
            from_vars(&[(SERVICE_NAME_VAR, "")]).service_name,
            DEFAULT_SERVICE_NAME
        );
    }
}
