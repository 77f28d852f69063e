//! Active health checking of registered instances
//!
//! The authority side of HTTP probe mode: every registered instance with an
//! HTTP probe target is sent `GET <path>` once per its own interval and the
//! answer is recorded in the registry.

use discovery_api::{HealthStatus, InstanceId, InstanceRecord, ProbeTarget};
use discovery_core::ServiceRegistry;
use dashmap::DashMap;
use futures::future::join_all;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Issues HTTP health probes
pub struct HealthChecker {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }

    /// Probe one instance; anything but a 2xx within the timeout is a failure
    pub async fn check_instance(&self, record: &InstanceRecord) -> HealthStatus {
        let ProbeTarget::Http { path } = &record.health_check.probe else {
            return HealthStatus::Pass;
        };
        let url = record.endpoint().url(path);
        let timeout = record.health_check.timeout;

        match time::timeout(timeout, self.check_single(&url)).await {
            Ok(Ok(true)) => {
                debug!(instance = %record.instance_id, %url, "Instance is healthy");
                HealthStatus::Pass
            }
            Ok(Ok(false)) => {
                warn!(instance = %record.instance_id, %url, "Health check failed");
                HealthStatus::Fail
            }
            Ok(Err(e)) => {
                warn!(instance = %record.instance_id, %url, error = %e, "Health check error");
                HealthStatus::Fail
            }
            Err(_) => {
                warn!(instance = %record.instance_id, %url, ?timeout, "Health check timeout");
                HealthStatus::Fail
            }
        }
    }

    async fn check_single(&self, url: &str) -> Result<bool, String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid probe url: {}", e))?;
        let request = Request::get(uri)
            .body(Empty::new())
            .map_err(|e| e.to_string())?;
        let response = self.client.request(request).await.map_err(|e| e.to_string())?;
        Ok(response.status().is_success())
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically probes registry entries and reaps the ones that stay down
pub struct HealthCheckMonitor {
    registry: Arc<ServiceRegistry>,
    checker: HealthChecker,
    tick: Duration,
    next_due: DashMap<InstanceId, Instant>,
}

impl HealthCheckMonitor {
    /// `tick` is how often due probes are looked for; each instance is
    /// probed at its own interval
    pub fn new(registry: Arc<ServiceRegistry>, tick: Duration) -> Self {
        Self {
            registry,
            checker: HealthChecker::new(),
            tick,
            next_due: DashMap::new(),
        }
    }

    /// Probe every instance that is due, then reap. Returns how many were probed.
    pub async fn run_once(&self) -> usize {
        let now = Instant::now();
        let targets = self.registry.http_probe_targets().await;
        self.next_due
            .retain(|id, _| targets.iter().any(|t| &t.instance_id == id));

        let due: Vec<InstanceRecord> = targets
            .into_iter()
            .filter(|t| self.next_due.get(&t.instance_id).map_or(true, |at| *at <= now))
            .collect();
        for record in &due {
            self.next_due
                .insert(record.instance_id, now + record.health_check.interval);
        }

        let results = join_all(due.iter().map(|record| async move {
            (record.instance_id, self.checker.check_instance(record).await)
        }))
        .await;

        for (id, status) in results {
            // The instance may have deregistered while it was being probed
            if let Err(e) = self.registry.record_check(&id, status).await {
                debug!(instance = %id, error = %e, "Dropped probe result");
            }
        }

        for reaped in self.registry.reap().await {
            self.next_due.remove(&reaped.instance_id);
        }
        due.len()
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health check monitor stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let probed = self.run_once().await;
                if probed > 0 {
                    debug!(probed, "Health check cycle complete");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port, spawn_server, text};
    use discovery_api::{HealthCheckDescriptor, ServiceName};
    use hyper::StatusCode;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn record(port: u16) -> InstanceRecord {
        InstanceRecord::new(
            ServiceName::new("catalog").unwrap(),
            "127.0.0.1",
            port,
            HealthCheckDescriptor::http("/healthz", Duration::from_millis(300), Duration::from_millis(200)),
        )
    }

    #[tokio::test]
    async fn test_check_instance() {
        let addr = spawn_server(|req| async move {
            if req.uri().path() == "/healthz" {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::NOT_FOUND, "")
            }
        })
        .await;
        let checker = HealthChecker::new();

        assert_eq!(checker.check_instance(&record(addr.port())).await, HealthStatus::Pass);
        assert_eq!(checker.check_instance(&record(closed_port())).await, HealthStatus::Fail);

        let mut wrong_path = record(addr.port());
        wrong_path.health_check.probe = ProbeTarget::Http { path: "/missing".into() };
        assert_eq!(checker.check_instance(&wrong_path).await, HealthStatus::Fail);
    }

    #[tokio::test]
    async fn test_slow_probe_fails() {
        let addr = spawn_server(|_| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            text(StatusCode::OK, "ok")
        })
        .await;
        let checker = HealthChecker::new();
        assert_eq!(checker.check_instance(&record(addr.port())).await, HealthStatus::Fail);
    }

    #[tokio::test]
    async fn test_monitor_records_results() {
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = healthy.clone();
        let addr = spawn_server(move |_| {
            let flag = flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    text(StatusCode::OK, "ok")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "draining")
                }
            }
        })
        .await;

        let registry = Arc::new(ServiceRegistry::new());
        let instance = record(addr.port());
        registry.register_instance(instance.clone()).await.unwrap();
        let monitor = HealthCheckMonitor::new(registry.clone(), Duration::from_millis(50));
        let catalog = ServiceName::new("catalog").unwrap();

        assert!(registry.healthy_instances(&catalog).await.is_empty());
        assert_eq!(monitor.run_once().await, 1);
        assert_eq!(registry.healthy_instances(&catalog).await, vec![instance.clone()]);

        // Not due again until its interval passes
        assert_eq!(monitor.run_once().await, 0);

        healthy.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(monitor.run_once().await, 1);
        assert!(registry.healthy_instances(&catalog).await.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_skips_heartbeat_instances() {
        let registry = Arc::new(ServiceRegistry::new());
        let heartbeat = InstanceRecord::new(
            ServiceName::new("orders").unwrap(),
            "127.0.0.1",
            closed_port(),
            HealthCheckDescriptor::heartbeat(Duration::from_secs(1), Duration::from_millis(500)),
        );
        registry.register_instance(heartbeat).await.unwrap();

        let monitor = HealthCheckMonitor::new(registry, Duration::from_millis(50));
        assert_eq!(monitor.run_once().await, 0);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_cancel() {
        let registry = Arc::new(ServiceRegistry::new());
        let monitor = Arc::new(HealthCheckMonitor::new(registry, Duration::from_millis(10)));
        let cancel = CancellationToken::new();
        let task = monitor.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
