use super::{Endpoint, InstanceId, InstanceRecord, ServiceName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Healthy instances of a service, in the order the authority returned them
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub service: ServiceName,
    pub instances: Vec<InstanceRecord>,
    /// When the authority produced this set
    pub fetched_at: DateTime<Utc>,
    /// Set when the authority could not be reached and an expired cache
    /// entry is being served instead
    #[serde(default)]
    pub stale: bool,
}

impl ResolutionResult {
    pub fn new(service: ServiceName, instances: Vec<InstanceRecord>) -> Self {
        Self {
            service,
            instances,
            fetched_at: Utc::now(),
            stale: false,
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.instances.iter().map(InstanceRecord::endpoint).collect()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.iter().any(|i| &i.instance_id == id)
    }

    /// Copy of this result flagged as stale
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}
