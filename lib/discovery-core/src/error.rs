use discovery_api::{InstanceId, ServiceName, ValidationError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type AuthorityResult<T> = std::result::Result<T, AuthorityError>;

/// Failures talking to the discovery authority
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthorityError {
    #[error("Authority unreachable: {0}")]
    Unreachable(String),

    #[error("Authority request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("Authority rejected request: {0}")]
    Rejected(String),

    #[error("Malformed instance record: {0}")]
    Malformed(#[from] ValidationError),
}

/// Registration failures. Never propagated to request handling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("Malformed instance record: {0}")]
    Malformed(#[from] ValidationError),

    #[error("Registration failed: {0}")]
    Authority(AuthorityError),
}

impl From<AuthorityError> for RegistrationError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Malformed(e) => RegistrationError::Malformed(e),
            other => RegistrationError::Authority(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The authority answered with zero healthy instances
    NoHealthyInstances,
    /// The authority could not be queried and nothing was cached
    AuthorityUnavailable,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::NoHealthyInstances => f.write_str("no healthy instances"),
            NotFoundReason::AuthorityUnavailable => f.write_str("authority unavailable"),
        }
    }
}

/// No usable endpoint for a service.
///
/// `transient == false` is reserved; every not-found produced today is
/// transient and means "try again shortly".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Service not found: {service} ({reason})")]
pub struct NotFoundError {
    pub service: ServiceName,
    pub transient: bool,
    pub reason: NotFoundReason,
}

impl NotFoundError {
    pub fn no_healthy_instances(service: &ServiceName) -> Self {
        Self {
            service: service.clone(),
            transient: true,
            reason: NotFoundReason::NoHealthyInstances,
        }
    }

    pub fn authority_unavailable(service: &ServiceName) -> Self {
        Self {
            service: service.clone(),
            transient: true,
            reason: NotFoundReason::AuthorityUnavailable,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ValidationError> for ConfigError {
    fn from(err: ValidationError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}
