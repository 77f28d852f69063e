//! Service registry tracking instance registrations and their liveness
//!
//! This is the authority's own store. It is constructed explicitly and
//! shared by `Arc`; nothing about it is process-global.

use crate::{Authority, AuthorityError, AuthorityResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use discovery_api::{HealthStatus, InstanceId, InstanceRecord, ProbeTarget, ServiceName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Liveness rules applied by the registry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A pass counts for `interval * staleness_factor` before it goes stale
    pub staleness_factor: u32,
    /// Entries that have not been healthy for this long are removed
    #[serde(rename = "reap_after_ms", with = "discovery_api::duration_ms")]
    pub reap_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_factor: 3,
            reap_after: Duration::from_secs(60),
        }
    }
}

/// Registration plus the health signals received for it
#[derive(Clone, Debug)]
pub struct InstanceEntry {
    pub record: InstanceRecord,
    pub registered_at: DateTime<Utc>,
    pub last_status: Option<HealthStatus>,
    pub consecutive_failures: u32,
    sequence: u64,
    registered: Instant,
    last_pass: Option<Instant>,
    failing_since: Option<Instant>,
}

impl InstanceEntry {
    fn new(record: InstanceRecord, sequence: u64) -> Self {
        Self {
            record,
            registered_at: Utc::now(),
            last_status: None,
            consecutive_failures: 0,
            sequence,
            registered: Instant::now(),
            last_pass: None,
            failing_since: None,
        }
    }

    fn staleness_window(&self, factor: u32) -> Duration {
        self.record.health_check.interval * factor.max(1)
    }

    /// Healthy means the most recent signal was a pass and it is not stale
    pub fn is_healthy(&self, now: Instant, staleness_factor: u32) -> bool {
        match (self.last_status, self.last_pass) {
            (Some(HealthStatus::Pass), Some(at)) => {
                now.saturating_duration_since(at) <= self.staleness_window(staleness_factor)
            }
            _ => false,
        }
    }

    /// Moment from which the entry has continuously been not healthy
    fn unhealthy_since(&self, now: Instant, staleness_factor: u32) -> Option<Instant> {
        if self.is_healthy(now, staleness_factor) {
            return None;
        }
        match (self.last_status, self.last_pass) {
            (Some(HealthStatus::Fail), _) => self.failing_since,
            (_, Some(at)) => Some(at + self.staleness_window(staleness_factor)),
            (_, None) => Some(self.registered),
        }
    }
}

/// Outcome of a registration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub instance_id: InstanceId,
    /// Previous registration at the same service/address/port, if any
    pub replaced: Option<InstanceId>,
}

/// ServiceRegistry maintains the registry of instances and their health
pub struct ServiceRegistry {
    instances: Arc<RwLock<HashMap<InstanceId, InstanceEntry>>>,
    next_sequence: AtomicU64,
    config: RegistryConfig,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            next_sequence: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an instance, replacing any entry at the same location
    pub async fn register_instance(&self, record: InstanceRecord) -> AuthorityResult<RegisterOutcome> {
        record.validate()?;

        let mut instances = self.instances.write().await;
        let replaced: Vec<InstanceId> = instances
            .values()
            .filter(|e| e.record.same_location(&record) && e.record.instance_id != record.instance_id)
            .map(|e| e.record.instance_id)
            .collect();
        for id in &replaced {
            instances.remove(id);
            info!(
                service = %record.service,
                old = %id,
                new = %record.instance_id,
                "Replaced registration at {}:{}",
                record.address,
                record.port
            );
        }

        let instance_id = record.instance_id;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        match instances.get_mut(&instance_id) {
            // Same id registered again: keep health history, refresh the record
            Some(existing) => existing.record = record,
            None => {
                debug!(service = %record.service, instance = %instance_id, "Registered instance");
                instances.insert(instance_id, InstanceEntry::new(record, sequence));
            }
        }

        Ok(RegisterOutcome {
            instance_id,
            replaced: replaced.into_iter().next(),
        })
    }

    /// Deregister an instance. Returns whether it was present.
    pub async fn deregister_instance(&self, id: &InstanceId) -> bool {
        let mut instances = self.instances.write().await;
        let removed = instances.remove(id);
        if let Some(entry) = &removed {
            debug!(service = %entry.record.service, instance = %id, "Deregistered instance");
        }
        removed.is_some()
    }

    /// Record a health check result for an instance
    pub async fn record_check(&self, id: &InstanceId, status: HealthStatus) -> AuthorityResult<()> {
        let now = Instant::now();
        let mut instances = self.instances.write().await;
        let entry = instances
            .get_mut(id)
            .ok_or(AuthorityError::UnknownInstance(*id))?;

        let previous = entry.last_status;
        entry.last_status = Some(status);
        match status {
            HealthStatus::Pass => {
                entry.consecutive_failures = 0;
                entry.last_pass = Some(now);
                entry.failing_since = None;
                if previous != Some(HealthStatus::Pass) {
                    info!(service = %entry.record.service, instance = %id, "Instance is passing");
                }
            }
            HealthStatus::Fail => {
                entry.consecutive_failures += 1;
                entry.failing_since.get_or_insert(now);
                if previous != Some(HealthStatus::Fail) {
                    warn!(service = %entry.record.service, instance = %id, "Instance is failing");
                }
            }
        }
        Ok(())
    }

    /// Healthy instances of a service, in registration order
    pub async fn healthy_instances(&self, service: &ServiceName) -> Vec<InstanceRecord> {
        let now = Instant::now();
        let instances = self.instances.read().await;
        let mut healthy: Vec<&InstanceEntry> = instances
            .values()
            .filter(|e| &e.record.service == service)
            .filter(|e| e.is_healthy(now, self.config.staleness_factor))
            .collect();
        healthy.sort_by_key(|e| e.sequence);
        healthy.into_iter().map(|e| e.record.clone()).collect()
    }

    pub async fn get_instance(&self, id: &InstanceId) -> Option<InstanceEntry> {
        let instances = self.instances.read().await;
        instances.get(id).cloned()
    }

    /// All entries, in registration order
    pub async fn list_instances(&self) -> Vec<InstanceEntry> {
        let instances = self.instances.read().await;
        let mut entries: Vec<InstanceEntry> = instances.values().cloned().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Records the authority has to probe actively
    pub async fn http_probe_targets(&self) -> Vec<InstanceRecord> {
        self.list_instances()
            .await
            .into_iter()
            .filter(|e| matches!(e.record.health_check.probe, ProbeTarget::Http { .. }))
            .map(|e| e.record)
            .collect()
    }

    /// Remove entries that have not been healthy for `reap_after`
    pub async fn reap(&self) -> Vec<InstanceRecord> {
        let now = Instant::now();
        let factor = self.config.staleness_factor;
        let reap_after = self.config.reap_after;

        let mut instances = self.instances.write().await;
        let expired: Vec<InstanceId> = instances
            .values()
            .filter(|e| {
                e.unhealthy_since(now, factor)
                    .map_or(false, |since| now.saturating_duration_since(since) >= reap_after)
            })
            .map(|e| e.record.instance_id)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = instances.remove(&id) {
                warn!(
                    service = %entry.record.service,
                    instance = %id,
                    failures = entry.consecutive_failures,
                    "Reaped instance that stayed unhealthy"
                );
                reaped.push(entry.record);
            }
        }
        reaped
    }

    pub async fn instance_count(&self) -> usize {
        let instances = self.instances.read().await;
        instances.len()
    }

    pub async fn service_count(&self) -> usize {
        let instances = self.instances.read().await;
        let mut names: Vec<&ServiceName> = instances.values().map(|e| &e.record.service).collect();
        names.sort();
        names.dedup();
        names.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authority for ServiceRegistry {
    async fn register(&self, record: &InstanceRecord) -> AuthorityResult<()> {
        self.register_instance(record.clone()).await.map(|_| ())
    }

    async fn deregister(&self, id: &InstanceId) -> AuthorityResult<()> {
        self.deregister_instance(id).await;
        Ok(())
    }

    async fn query_healthy(&self, service: &ServiceName) -> AuthorityResult<Vec<InstanceRecord>> {
        Ok(self.healthy_instances(service).await)
    }

    async fn report_health(&self, id: &InstanceId, status: HealthStatus) -> AuthorityResult<()> {
        self.record_check(id, status).await
    }
}
