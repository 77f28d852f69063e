//! Contract with the discovery authority
//!
//! The authority is the system of record for instance liveness and location.
//! The core only needs four operations from it; any transport (in-process,
//! HTTP+JSON, RPC) can sit behind this trait.

use crate::{AuthorityError, AuthorityResult};
use async_trait::async_trait;
use discovery_api::{HealthStatus, InstanceId, InstanceRecord, ServiceName};
use std::future::Future;
use std::time::Duration;

#[async_trait]
pub trait Authority: Send + Sync {
    /// Register (or replace, by service/address/port) an instance
    async fn register(&self, record: &InstanceRecord) -> AuthorityResult<()>;

    /// Remove a registration. Unknown ids are not an error.
    async fn deregister(&self, id: &InstanceId) -> AuthorityResult<()>;

    /// Healthy instances of a service in the authority's order
    async fn query_healthy(&self, service: &ServiceName) -> AuthorityResult<Vec<InstanceRecord>>;

    /// Push a check result for a heartbeat-mode instance
    async fn report_health(&self, id: &InstanceId, status: HealthStatus) -> AuthorityResult<()>;
}

/// Bound an authority call; an elapsed deadline becomes [`AuthorityError::Timeout`]
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> AuthorityResult<T>
where
    F: Future<Output = AuthorityResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AuthorityError::Timeout(timeout)),
    }
}
