//! Process configuration
//!
//! Configuration is read from an optional YAML file (path in
//! `DISCOVERY_CONFIG`) and then overridden by a handful of environment
//! variables. Every field has a default, so an empty file is valid.

use crate::health::HealthConfig;
use crate::registrar::RegistrarConfig;
use crate::registry::RegistryConfig;
use crate::resolver::ResolverConfig;
use crate::{ConfigError, InstanceIdentity};
use discovery_api::ServiceName;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "DISCOVERY_CONFIG";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Logical name this process registers under
    pub name: Option<String>,
    /// Address to bind listeners on
    pub listen_address: String,
    pub port: u16,
    /// Address other processes should use; detected when unset
    pub advertise_address: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: None,
            listen_address: "0.0.0.0".to_string(),
            port: 8080,
            advertise_address: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    pub url: String,
    #[serde(rename = "request_timeout_ms", with = "discovery_api::duration_ms")]
    pub request_timeout: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8500".to_string(),
            request_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bound on one forwarded request, independent of health check timeouts
    #[serde(rename = "request_timeout_ms", with = "discovery_api::duration_ms")]
    pub request_timeout: Duration,
    /// Retry once on another instance after a transport failure
    pub retry_on_transport_failure: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry_on_transport_failure: true,
        }
    }
}

/// Configuration shared by every process in the discovery system
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub service: ServiceConfig,
    pub authority: AuthorityConfig,
    pub registry: RegistryConfig,
    pub registrar: RegistrarConfig,
    pub health: HealthConfig,
    pub resolver: ResolverConfig,
    pub dispatch: DispatchConfig,
}

impl DiscoveryConfig {
    /// Apply environment overrides through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("DISCOVERY_SERVICE_NAME") {
            self.service.name = Some(name);
        }
        if let Some(port) = lookup("DISCOVERY_SERVICE_PORT") {
            self.service.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("DISCOVERY_SERVICE_PORT={}", port)))?;
        }
        if let Some(address) = lookup("DISCOVERY_ADVERTISE_ADDRESS") {
            self.service.advertise_address = Some(address);
        }
        if let Some(url) = lookup("DISCOVERY_AUTHORITY_URL") {
            self.authority.url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.service.name {
            ServiceName::new(name.clone())?;
        }
        self.health.descriptor().validate()?;
        if self.authority.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("authority.request_timeout_ms must be positive".into()));
        }
        if self.dispatch.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("dispatch.request_timeout_ms must be positive".into()));
        }
        if self.resolver.query_timeout.is_zero() {
            return Err(ConfigError::Invalid("resolver.query_timeout_ms must be positive".into()));
        }
        if self.registrar.backoff.initial.is_zero() || self.registrar.backoff.max < self.registrar.backoff.initial {
            return Err(ConfigError::Invalid("registrar.backoff must satisfy 0 < initial <= max".into()));
        }
        Ok(())
    }

    /// The configured service name; required by processes that register
    pub fn service_name(&self) -> Result<ServiceName, ConfigError> {
        let name = self
            .service
            .name
            .clone()
            .ok_or_else(|| ConfigError::Invalid("service.name is required".into()))?;
        Ok(ServiceName::new(name)?)
    }

    pub fn identity(&self) -> Result<InstanceIdentity, ConfigError> {
        Ok(InstanceIdentity::detect(
            self.service_name()?,
            self.service.port,
            self.service.advertise_address.as_deref(),
        )?)
    }
}

/// Process configuration types that embed a [`DiscoveryConfig`]
pub trait HasDiscoveryConfig {
    fn discovery(&self) -> &DiscoveryConfig;
    fn discovery_mut(&mut self) -> &mut DiscoveryConfig;
}

impl HasDiscoveryConfig for DiscoveryConfig {
    fn discovery(&self) -> &DiscoveryConfig {
        self
    }

    fn discovery_mut(&mut self) -> &mut DiscoveryConfig {
        self
    }
}

pub fn from_yaml_str<T: DeserializeOwned + Default>(yaml: &str) -> Result<T, ConfigError> {
    if yaml.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

pub fn from_file<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    from_yaml_str(&contents)
}

/// Load from `DISCOVERY_CONFIG` (if set), apply env overrides and validate
pub fn load<T>() -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default + HasDiscoveryConfig,
{
    let mut config: T = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            info!("Loading configuration from {}", path);
            from_file(&path)?
        }
        Err(_) => T::default(),
    };
    config
        .discovery_mut()
        .apply_overrides(|key| std::env::var(key).ok())?;
    config.discovery().validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ProbeMode;
    use crate::load_balancer::SelectionStrategy;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: DiscoveryConfig = from_yaml_str("").unwrap();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.resolver.cache_ttl, Duration::from_secs(5));
        assert_eq!(config.registrar.backoff.initial, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
service:
  name: catalog
  port: 9001
health:
  mode: heartbeat
  interval_ms: 3000
  timeout_ms: 1000
resolver:
  cache_ttl_ms: 250
  strategy: round_robin
dispatch:
  retry_on_transport_failure: false
"#;
        let config: DiscoveryConfig = from_yaml_str(yaml).unwrap();
        assert_eq!(config.service_name().unwrap().as_str(), "catalog");
        assert_eq!(config.service.port, 9001);
        assert_eq!(config.health.mode, ProbeMode::Heartbeat);
        assert_eq!(config.health.interval, Duration::from_secs(3));
        assert_eq!(config.resolver.cache_ttl, Duration::from_millis(250));
        assert_eq!(config.resolver.strategy, SelectionStrategy::RoundRobin);
        assert!(!config.dispatch.retry_on_transport_failure);
        // Untouched sections keep defaults
        assert_eq!(config.dispatch.request_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_health_timeout_must_be_below_interval() {
        let yaml = "health:\n  interval_ms: 1000\n  timeout_ms: 1000\n";
        let config: DiscoveryConfig = from_yaml_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DISCOVERY_SERVICE_NAME", "orders"),
            ("DISCOVERY_SERVICE_PORT", "7000"),
            ("DISCOVERY_ADVERTISE_ADDRESS", "10.1.2.3"),
            ("DISCOVERY_AUTHORITY_URL", "http://authority:8500"),
        ]);
        let mut config = DiscoveryConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        let identity = config.identity().unwrap();
        assert_eq!(identity.service.as_str(), "orders");
        assert_eq!(identity.address, "10.1.2.3");
        assert_eq!(identity.port, 7000);
        assert_eq!(config.authority.url, "http://authority:8500");
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = DiscoveryConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "DISCOVERY_SERVICE_PORT").then(|| "eighty".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_service_name_required_for_identity() {
        let config = DiscoveryConfig::default();
        assert!(config.identity().is_err());

        let mut bad = DiscoveryConfig::default();
        bad.service.name = Some("Not Valid".into());
        assert!(bad.validate().is_err());
    }
}
