//! v1 discovery types

pub mod instance;
pub mod resolution;
pub mod wire;

pub use instance::{
    Endpoint, HealthCheckDescriptor, HealthStatus, InstanceId, InstanceRecord, ProbeTarget,
    ServiceName,
};
pub use resolution::ResolutionResult;
