//! Discovery API types shared by the authority, its clients and the gateway
//!
//! This library defines the data model of the discovery subsystem:
//! - ServiceName / InstanceId: identifiers for logical services and registrations
//! - InstanceRecord: one running process's registration entry
//! - HealthCheckDescriptor: how the authority decides an instance is alive
//! - ResolutionResult: the healthy instances of a service at a point in time
//! - Wire bodies for the authority's HTTP+JSON protocol

pub mod duration_ms;
pub mod error;
pub mod v1;

pub use error::ValidationError;
pub use v1::{
    Endpoint, HealthCheckDescriptor, HealthStatus, InstanceId, InstanceRecord, ProbeTarget,
    ResolutionResult, ServiceName,
};
