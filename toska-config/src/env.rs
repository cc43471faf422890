// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable loader
///
/// Empty values count as unset.
#[derive(Clone)]
pub struct EnvLoader {
    prefix: Option<String>,
    lookup: Lookup,
}

impl EnvLoader {
    /// Read from the process environment
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            lookup: Arc::new(|key| env::var(key).ok()),
        }
    }

    /// Read from a fixed set of variables instead of the process environment
    pub fn from_map(prefix: Option<String>, vars: HashMap<String, String>) -> Self {
        Self {
            prefix,
            lookup: Arc::new(move |key| vars.get(key).cloned()),
        }
    }

    /// Full variable name for `key`
    pub fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key.to_uppercase()),
            None => key.to_uppercase(),
        }
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = self.full_key(key);
        (self.lookup)(&full_key)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::KeyNotFound(full_key))
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }

    /// Load and parse a variable
    pub fn load_parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.load_var(key)?;
        raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: self.full_key(key),
            message: format!("{raw:?}: {e}"),
        })
    }

    /// Load and parse a variable, falling back to `default` when it is unset
    /// or does not parse
    pub fn load_parsed_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.load_parsed(key) {
            Ok(value) => value,
            Err(ConfigError::KeyNotFound(_)) => default,
            Err(e) => {
                warn!(error = %e, "Ignoring unparseable value, using default");
                default
            }
        }
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for EnvLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvLoader")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Load a `.env` file from the current directory or its parents into the
/// process environment. Variables already set are left alone.
///
/// Returns the path loaded, or None when there is no such file.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => {
            debug!(path = %path.display(), "Loaded .env file");
            Ok(Some(path))
        }
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(prefix: Option<&str>, vars: &[(&str, &str)]) -> EnvLoader {
        EnvLoader::from_map(
            prefix.map(str::to_string),
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_env_loader_with_default() {
        let loader = EnvLoader::new(None);
        let value = loader.load_var_or("NONEXISTENT_VAR_12345", "default");

        assert_eq!(value, "default");
    }

    #[test]
    fn test_prefix_and_uppercase() {
        let loader = loader(Some("MESH"), &[("MESH_SERVICE_NAME", "orders")]);

        assert_eq!(loader.full_key("service_name"), "MESH_SERVICE_NAME");
        assert_eq!(loader.load_var("service_name").unwrap(), "orders");
    }

    #[test]
    fn test_missing_and_empty_are_not_found() {
        let loader = loader(None, &[("EMPTY", "")]);

        assert!(matches!(
            loader.load_var("EMPTY"),
            Err(ConfigError::KeyNotFound(k)) if k == "EMPTY"
        ));
        assert!(matches!(loader.load_var("ABSENT"), Err(ConfigError::KeyNotFound(_))));
        assert_eq!(loader.load_var_or("EMPTY", "fallback"), "fallback");
    }

    #[test]
    fn test_load_parsed() {
        let loader = loader(None, &[("PORT", "9191"), ("BAD", "nine")]);

        assert_eq!(loader.load_parsed::<u16>("PORT").unwrap(), 9191);
        assert!(matches!(
            loader.load_parsed::<u16>("BAD"),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_load_parsed_or_falls_back() {
        let loader = loader(None, &[("BAD", "nine"), ("HUGE", "70000")]);

        assert_eq!(loader.load_parsed_or("BAD", 9090u16), 9090);
        assert_eq!(loader.load_parsed_or("HUGE", 9090u16), 9090);
        assert_eq!(loader.load_parsed_or("ABSENT", 9090u16), 9090);
    }

    #[test]
    fn test_env_loader_path_exists() {
        // PATH is almost always set on any system
        let loader = EnvLoader::new(None);
        if std::env::var("PATH").is_ok_and(|p| !p.is_empty()) {
            assert!(loader.load_var("PATH").is_ok());
        }
    }
}
