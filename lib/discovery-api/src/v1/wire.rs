//! Request and response bodies of the authority's HTTP+JSON protocol
//!
//! - `PUT /v1/instances` with an [`InstanceRecord`] body, answered by [`RegisterResponse`]
//! - `DELETE /v1/instances/{id}`
//! - `PUT /v1/instances/{id}/health` with a [`HealthReport`] body
//! - `GET /v1/services/{name}/healthy`, answered by a JSON array of [`InstanceRecord`]
//!
//! [`InstanceRecord`]: super::InstanceRecord

use super::{HealthStatus, InstanceId};
use serde::{Deserialize, Serialize};

pub const INSTANCES_PATH: &str = "/v1/instances";
pub const SERVICES_PATH: &str = "/v1/services";

pub fn instance_path(id: &InstanceId) -> String {
    format!("{}/{}", INSTANCES_PATH, id)
}

pub fn health_path(id: &InstanceId) -> String {
    format!("{}/{}/health", INSTANCES_PATH, id)
}

pub fn healthy_path(service: &str) -> String {
    format!("{}/{}/healthy", SERVICES_PATH, service)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub instance_id: InstanceId,
    /// Instance that was replaced because it occupied the same location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced: Option<InstanceId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
