use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid service name {0:?}: {1}")]
    ServiceName(String, &'static str),

    #[error("Invalid instance id: {0}")]
    InstanceId(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Invalid port: {0}")]
    Port(u16),

    #[error("Invalid health check: {0}")]
    HealthCheck(String),
}
