use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const MAX_SERVICE_NAME_LEN: usize = 63;

/// Logical name of a service, e.g. "catalog" or "orders"
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Create a service name, rejecting empty or non DNS-label-like names
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::ServiceName(name, "must not be empty"));
        }
        if name.len() > MAX_SERVICE_NAME_LEN {
            return Err(ValidationError::ServiceName(name, "longer than 63 characters"));
        }
        let valid = name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'));
        if !valid {
            return Err(ValidationError::ServiceName(
                name,
                "only lowercase letters, digits, '-', '_' and '.' are allowed",
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServiceName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

/// Identifier of a single registration. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ValidationError::InstanceId(s.to_string()))
    }
}

/// Network location of an instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Build an `http://` URL for a path on this endpoint
    pub fn url(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("http://{}{}", self.authority(), path_and_query)
        } else {
            format!("http://{}/{}", self.authority(), path_and_query)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Binary result of a health check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Fail,
}

impl HealthStatus {
    pub fn is_pass(self) -> bool {
        self == HealthStatus::Pass
    }
}

/// Where the liveness signal for an instance comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeTarget {
    /// The authority issues `GET path` against the instance
    Http { path: String },
    /// The instance pushes its own check results to the authority
    Heartbeat,
}

/// Health probe attached to a registration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckDescriptor {
    pub probe: ProbeTarget,
    #[serde(rename = "interval_ms", with = "crate::duration_ms")]
    pub interval: Duration,
    #[serde(rename = "timeout_ms", with = "crate::duration_ms")]
    pub timeout: Duration,
}

impl HealthCheckDescriptor {
    pub fn http(path: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            probe: ProbeTarget::Http { path: path.into() },
            interval,
            timeout,
        }
    }

    pub fn heartbeat(interval: Duration, timeout: Duration) -> Self {
        Self {
            probe: ProbeTarget::Heartbeat,
            interval,
            timeout,
        }
    }

    /// Timeout must be strictly below the interval so at most one probe is
    /// outstanding per cycle.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval.is_zero() {
            return Err(ValidationError::HealthCheck("interval must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(ValidationError::HealthCheck("timeout must be positive".into()));
        }
        if self.timeout >= self.interval {
            return Err(ValidationError::HealthCheck(format!(
                "timeout {:?} must be shorter than interval {:?}",
                self.timeout, self.interval
            )));
        }
        if let ProbeTarget::Http { path } = &self.probe {
            if !path.starts_with('/') {
                return Err(ValidationError::HealthCheck(format!(
                    "probe path {:?} must start with '/'",
                    path
                )));
            }
        }
        Ok(())
    }
}

impl Default for HealthCheckDescriptor {
    fn default() -> Self {
        Self::http("/healthz", Duration::from_secs(10), Duration::from_secs(5))
    }
}

/// One running process's registration entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub service: ServiceName,
    pub instance_id: InstanceId,
    pub address: String,
    pub port: u16,
    pub health_check: HealthCheckDescriptor,
}

impl InstanceRecord {
    /// Create a record with a freshly minted instance id
    pub fn new(
        service: ServiceName,
        address: impl Into<String>,
        port: u16,
        health_check: HealthCheckDescriptor,
    ) -> Self {
        Self {
            service,
            instance_id: InstanceId::generate(),
            address: address.into(),
            port,
            health_check,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }

    /// Whether both records describe the same (service, address, port)
    pub fn same_location(&self, other: &InstanceRecord) -> bool {
        self.service == other.service && self.address == other.address && self.port == other.port
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.address.trim().is_empty() || self.address.contains('/') {
            return Err(ValidationError::Address(self.address.clone()));
        }
        if self.port == 0 {
            return Err(ValidationError::Port(self.port));
        }
        self.health_check.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ServiceName {
        ServiceName::new("catalog").unwrap()
    }

    #[test]
    fn test_service_name_validation() {
        assert!(ServiceName::new("catalog").is_ok());
        assert!(ServiceName::new("order-service.v2").is_ok());
        assert!(ServiceName::new("").is_err());
        assert!(ServiceName::new("Catalog").is_err());
        assert!(ServiceName::new("has space").is_err());
        assert!(ServiceName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_service_name_rejected_on_deserialize() {
        let parsed: Result<ServiceName, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
        let parsed: ServiceName = serde_json::from_str("\"orders\"").unwrap();
        assert_eq!(parsed.as_str(), "orders");
    }

    #[test]
    fn test_instance_ids_are_unique() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
        let id = InstanceId::generate();
        assert_eq!(id.to_string().parse::<InstanceId>().unwrap(), id);
        assert!("not-a-uuid".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_endpoint_url() {
        let endpoint = Endpoint::new("10.0.0.1", 8080);
        assert_eq!(endpoint.url("/items?page=2"), "http://10.0.0.1:8080/items?page=2");
        assert_eq!(endpoint.url("items"), "http://10.0.0.1:8080/items");

        let v6 = Endpoint::new("fd00::1", 80);
        assert_eq!(v6.authority(), "[fd00::1]:80");
    }

    #[test]
    fn test_descriptor_timeout_must_be_below_interval() {
        let ok = HealthCheckDescriptor::http("/healthz", Duration::from_secs(10), Duration::from_secs(2));
        assert!(ok.validate().is_ok());

        let equal = HealthCheckDescriptor::heartbeat(Duration::from_secs(5), Duration::from_secs(5));
        assert!(equal.validate().is_err());

        let bad_path = HealthCheckDescriptor::http("healthz", Duration::from_secs(10), Duration::from_secs(2));
        assert!(bad_path.validate().is_err());
    }

    #[test]
    fn test_descriptor_wire_format() {
        let descriptor = HealthCheckDescriptor::http("/healthz", Duration::from_secs(10), Duration::from_millis(1500));
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["probe"]["kind"], "http");
        assert_eq!(json["probe"]["path"], "/healthz");
        assert_eq!(json["interval_ms"], 10_000);
        assert_eq!(json["timeout_ms"], 1_500);
    }

    #[test]
    fn test_record_validation() {
        let record = InstanceRecord::new(catalog(), "10.0.0.1", 8080, HealthCheckDescriptor::default());
        assert!(record.validate().is_ok());

        let mut no_port = record.clone();
        no_port.port = 0;
        assert_eq!(no_port.validate(), Err(ValidationError::Port(0)));

        let mut no_address = record.clone();
        no_address.address = " ".to_string();
        assert!(no_address.validate().is_err());
    }

    #[test]
    fn test_same_location_ignores_instance_id() {
        let a = InstanceRecord::new(catalog(), "10.0.0.1", 8080, HealthCheckDescriptor::default());
        let b = InstanceRecord::new(catalog(), "10.0.0.1", 8080, HealthCheckDescriptor::default());
        assert_ne!(a.instance_id, b.instance_id);
        assert!(a.same_location(&b));

        let c = InstanceRecord::new(catalog(), "10.0.0.1", 8081, HealthCheckDescriptor::default());
        assert!(!a.same_location(&c));
    }
}
