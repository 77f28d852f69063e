//! Health reporting for this process
//!
//! The reporter owns its checks and keeps no state shared with request
//! handling, so a probe is never queued behind business logic.

use crate::authority::{with_timeout, Authority};
use crate::registrar::RegistrationWatch;
use crate::AuthorityError;
use async_trait::async_trait;
use discovery_api::{HealthCheckDescriptor, HealthStatus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single health check
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` carries the reason the check failed
    async fn check(&self) -> Result<(), String>;
}

/// Passes while a TCP connection to `addr` can be opened
pub struct TcpListenerCheck {
    addr: SocketAddr,
}

impl TcpListenerCheck {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl HealthCheck for TcpListenerCheck {
    fn name(&self) -> &str {
        "listener"
    }

    async fn check(&self) -> Result<(), String> {
        tokio::net::TcpStream::connect(self.addr)
            .await
            .map(|_| ())
            .map_err(|e| format!("connect {}: {}", self.addr, e))
    }
}

/// Manually toggled check, e.g. for draining an instance
pub struct FlagCheck {
    name: String,
    healthy: AtomicBool,
}

impl FlagCheck {
    pub fn new(name: impl Into<String>, healthy: bool) -> Self {
        Self {
            name: name.into(),
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthCheck for FlagCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<(), String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("marked unhealthy".to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// The authority probes our health endpoint
    #[default]
    Http,
    /// We push check results to the authority
    Heartbeat,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub mode: ProbeMode,
    /// Liveness path answered by the reporter
    pub path: String,
    /// Readiness path
    pub readiness_path: String,
    #[serde(rename = "interval_ms", with = "discovery_api::duration_ms")]
    pub interval: Duration,
    #[serde(rename = "timeout_ms", with = "discovery_api::duration_ms")]
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::Http,
            path: "/healthz".to_string(),
            readiness_path: "/readyz".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
        }
    }
}

impl HealthConfig {
    /// Descriptor published with the registration
    pub fn descriptor(&self) -> HealthCheckDescriptor {
        match self.mode {
            ProbeMode::Http => HealthCheckDescriptor::http(self.path.clone(), self.interval, self.timeout),
            ProbeMode::Heartbeat => HealthCheckDescriptor::heartbeat(self.interval, self.timeout),
        }
    }
}

/// Result of running all checks once
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// (check name, reason) for each failed check
    pub failures: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Not yet registered, or not passing its checks
    Starting,
    Ready,
}

const STATUS_UNKNOWN: u8 = 0;
const STATUS_PASS: u8 = 1;
const STATUS_FAIL: u8 = 2;

/// HealthReporter runs the process's checks and publishes the result
pub struct HealthReporter {
    checks: Vec<Arc<dyn HealthCheck>>,
    timeout: Duration,
    last_status: AtomicU8,
    registration: OnceLock<RegistrationWatch>,
}

impl HealthReporter {
    /// Create a reporter whose checks must each finish within `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            timeout,
            last_status: AtomicU8::new(STATUS_UNKNOWN),
            registration: OnceLock::new(),
        }
    }

    pub fn with_check<C: HealthCheck + 'static>(self, check: C) -> Self {
        self.with_shared_check(Arc::new(check))
    }

    pub fn with_shared_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Make readiness depend on this registration
    pub fn attach_registration(&self, watch: RegistrationWatch) {
        if self.registration.set(watch).is_err() {
            warn!("Registration already attached to health reporter");
        }
    }

    /// Run every check concurrently; any failure or timeout fails the report
    pub async fn check(&self) -> HealthReport {
        let timeout = self.timeout;
        let runs = self.checks.iter().map(|check| async move {
            let outcome = match tokio::time::timeout(timeout, check.check()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            };
            (check.name().to_string(), outcome)
        });

        let failures: Vec<(String, String)> = join_all(runs)
            .await
            .into_iter()
            .filter_map(|(name, outcome)| outcome.err().map(|reason| (name, reason)))
            .collect();

        let status = if failures.is_empty() {
            HealthStatus::Pass
        } else {
            HealthStatus::Fail
        };
        let encoded = if status.is_pass() { STATUS_PASS } else { STATUS_FAIL };
        let previous = self.last_status.swap(encoded, Ordering::AcqRel);
        if previous != encoded {
            match status {
                HealthStatus::Pass => debug!("Health checks passing"),
                HealthStatus::Fail => warn!(?failures, "Health checks failing"),
            }
        }

        HealthReport { status, failures }
    }

    pub fn last_status(&self) -> Option<HealthStatus> {
        match self.last_status.load(Ordering::Acquire) {
            STATUS_PASS => Some(HealthStatus::Pass),
            STATUS_FAIL => Some(HealthStatus::Fail),
            _ => None,
        }
    }

    /// Ready once registered (if a registration is attached) and passing
    pub async fn readiness(&self) -> Readiness {
        if let Some(registration) = self.registration.get() {
            if !registration.is_registered() {
                return Readiness::Starting;
            }
        }
        match self.check().await.status {
            HealthStatus::Pass => Readiness::Ready,
            HealthStatus::Fail => Readiness::Starting,
        }
    }

    /// Push check results to the authority every `interval` while registered.
    ///
    /// An "unknown instance" answer means the authority dropped us, so the
    /// registration task is asked to register again.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        authority: Arc<dyn Authority>,
        registration: RegistrationWatch,
        descriptor: &HealthCheckDescriptor,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let reporter = self.clone();
        let period = descriptor.interval;
        let rpc_timeout = descriptor.timeout;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Heartbeat task stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let Some(id) = registration.instance_id() else {
                    continue;
                };
                let report = reporter.check().await;
                match with_timeout(rpc_timeout, authority.report_health(&id, report.status)).await {
                    Ok(()) => debug!(instance = %id, status = ?report.status, "Heartbeat sent"),
                    Err(AuthorityError::UnknownInstance(_)) => {
                        warn!(instance = %id, "Authority does not know this instance");
                        registration.request_reregister();
                    }
                    Err(e) => warn!(instance = %id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{Registrar, RegistrarConfig, RegistrationStatus};
    use crate::ServiceRegistry;
    use discovery_api::{InstanceRecord, ServiceName};

    struct SlowCheck;

    #[async_trait]
    impl HealthCheck for SlowCheck {
        fn name(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_checks_passes() {
        let reporter = HealthReporter::new(Duration::from_secs(1));
        assert_eq!(reporter.last_status(), None);
        assert_eq!(reporter.check().await.status, HealthStatus::Pass);
        assert_eq!(reporter.last_status(), Some(HealthStatus::Pass));
    }

    #[tokio::test]
    async fn test_failing_check_fails_report() {
        let flag = Arc::new(FlagCheck::new("draining", true));
        let reporter = HealthReporter::new(Duration::from_secs(1)).with_shared_check(flag.clone());
        assert_eq!(reporter.check().await.status, HealthStatus::Pass);

        flag.set(false);
        let report = reporter.check().await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert_eq!(report.failures, vec![("draining".to_string(), "marked unhealthy".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_check_times_out_as_fail() {
        let reporter = HealthReporter::new(Duration::from_millis(500)).with_check(SlowCheck);
        let started = tokio::time::Instant::now();
        let report = reporter.check().await;
        assert_eq!(report.status, HealthStatus::Fail);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tcp_listener_check() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let check = TcpListenerCheck::new(addr);
        assert!(check.check().await.is_ok());

        drop(listener);
        assert!(check.check().await.is_err());
    }

    #[test]
    fn test_descriptor_from_config() {
        let config = HealthConfig {
            mode: ProbeMode::Heartbeat,
            ..HealthConfig::default()
        };
        let descriptor = config.descriptor();
        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.probe, discovery_api::ProbeTarget::Heartbeat);
    }

    #[tokio::test]
    async fn test_readiness_follows_registration() {
        let authority = Arc::new(ServiceRegistry::new());
        let registrar = Registrar::new(authority.clone(), RegistrarConfig::default());
        let reporter = HealthReporter::new(Duration::from_secs(1));

        let record = InstanceRecord::new(
            ServiceName::new("orders").unwrap(),
            "10.0.0.7",
            9000,
            HealthConfig::default().descriptor(),
        );
        let handle = registrar.register(record).unwrap();
        reporter.attach_registration(handle.watch());

        handle.wait_registered(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reporter.readiness().await, Readiness::Ready);

        let watch = handle.watch();
        handle.shutdown().await;
        assert_eq!(watch.status(), RegistrationStatus::Deregistered);
        assert_eq!(reporter.readiness().await, Readiness::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_instance_healthy() {
        let authority = Arc::new(ServiceRegistry::new());
        let registrar = Registrar::new(authority.clone(), RegistrarConfig::default());
        let flag = Arc::new(FlagCheck::new("app", true));
        let reporter = Arc::new(HealthReporter::new(Duration::from_millis(500)).with_shared_check(flag.clone()));

        let descriptor = HealthCheckDescriptor::heartbeat(Duration::from_secs(5), Duration::from_secs(1));
        let service = ServiceName::new("orders").unwrap();
        let record = InstanceRecord::new(service.clone(), "10.0.0.7", 9000, descriptor.clone());
        let handle = registrar.register(record).unwrap();
        handle.wait_registered(Duration::from_secs(1)).await.unwrap();

        let cancel = CancellationToken::new();
        let task = reporter.spawn_heartbeat(authority.clone(), handle.watch(), &descriptor, cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(authority.healthy_instances(&service).await.len(), 1);

        flag.set(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(authority.healthy_instances(&service).await.is_empty());

        cancel.cancel();
        task.await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_unknown_instance_triggers_reregistration() {
        let authority = Arc::new(ServiceRegistry::new());
        let registrar = Registrar::new(authority.clone(), RegistrarConfig::default());
        let reporter = Arc::new(HealthReporter::new(Duration::from_millis(500)));

        let descriptor = HealthCheckDescriptor::heartbeat(Duration::from_secs(5), Duration::from_secs(1));
        let service = ServiceName::new("orders").unwrap();
        let record = InstanceRecord::new(service.clone(), "10.0.0.7", 9000, descriptor.clone());
        let handle = registrar.register(record).unwrap();
        let first = handle.wait_registered(Duration::from_secs(1)).await.unwrap();

        authority.deregister_instance(&first).await;
        let cancel = CancellationToken::new();
        let task = reporter.spawn_heartbeat(authority.clone(), handle.watch(), &descriptor, cancel.clone());

        // First tick hits the unknown instance, next tick reports for the new one
        tokio::time::sleep(Duration::from_secs(6)).await;
        let healthy = authority.healthy_instances(&service).await;
        assert_eq!(healthy.len(), 1);
        assert_ne!(healthy[0].instance_id, first);

        cancel.cancel();
        task.await.unwrap();
        handle.shutdown().await;
    }
}
