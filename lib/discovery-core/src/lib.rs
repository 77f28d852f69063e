//! Core service discovery functionality
//!
//! This library provides:
//! - Instance identity and self-registration with the authority
//! - Health reporting (probe answers and heartbeats)
//! - The in-memory registry the authority keeps
//! - Resolution of service names with caching and pluggable selection

pub mod authority;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod load_balancer;
pub mod registrar;
pub mod registry;
pub mod resolver;

pub use authority::Authority;
pub use config::{DiscoveryConfig, DispatchConfig};
pub use error::{
    AuthorityError, AuthorityResult, ConfigError, NotFoundError, NotFoundReason, RegistrationError,
};
pub use health::{HealthCheck, HealthConfig, HealthReporter, ProbeMode, Readiness};
pub use identity::InstanceIdentity;
pub use load_balancer::{LoadBalancer, SelectionStrategy};
pub use registrar::{
    Registrar, RegistrarConfig, RegistrationHandle, RegistrationStatus, RegistrationWatch,
};
pub use registry::{RegistryConfig, ServiceRegistry};
pub use resolver::{Resolver, ResolverConfig};
