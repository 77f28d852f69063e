//! Self-registration of this process with the authority
//!
//! Registration never blocks startup and never takes the process down: a
//! supervised task keeps retrying with backoff until it succeeds, then waits
//! for either a re-registration request or shutdown, at which point it
//! deregisters on a best-effort basis.

use crate::authority::{with_timeout, Authority};
use crate::{AuthorityError, RegistrationError};
use discovery_api::{InstanceId, InstanceRecord, ServiceName};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff between registration attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(rename = "initial_ms", with = "discovery_api::duration_ms")]
    pub initial: Duration,
    #[serde(rename = "max_ms", with = "discovery_api::duration_ms")]
    pub max: Duration,
    /// Randomize each delay into `[delay / 2, delay]`
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given number of failed attempts (0-based)
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base = self.initial.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count.min(32));
        let capped = base
            .saturating_mul(exponential)
            .min(self.max.as_millis() as u64);
        let millis = if self.jitter && capped > 1 {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Bound on a single register call
    #[serde(rename = "register_timeout_ms", with = "discovery_api::duration_ms")]
    pub register_timeout: Duration,
    /// Bound on the best-effort deregister at shutdown
    #[serde(rename = "deregister_timeout_ms", with = "discovery_api::duration_ms")]
    pub deregister_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            register_timeout: Duration::from_secs(3),
            deregister_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Observable state of the registration task
#[derive(Clone, Debug, PartialEq)]
pub enum RegistrationStatus {
    Pending,
    Registering { attempt: u32 },
    Registered(InstanceId),
    /// Last attempt failed; another one is scheduled
    Degraded { attempts: u32, last_error: String },
    Deregistered,
}

impl RegistrationStatus {
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            RegistrationStatus::Registered(id) => Some(*id),
            _ => None,
        }
    }
}

/// Registrar registers this process with the authority
#[derive(Clone)]
pub struct Registrar {
    authority: Arc<dyn Authority>,
    config: RegistrarConfig,
}

impl Registrar {
    pub fn new(authority: Arc<dyn Authority>, config: RegistrarConfig) -> Self {
        Self { authority, config }
    }

    /// Validate the record and start the supervised registration task.
    ///
    /// Only a malformed record is an error here; an unreachable authority
    /// is retried in the background and visible through the handle's status.
    pub fn register(&self, record: InstanceRecord) -> Result<RegistrationHandle, RegistrationError> {
        record.validate()?;

        let (status_tx, status_rx) = watch::channel(RegistrationStatus::Pending);
        let reregister = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let service = record.service.clone();

        let supervisor = Supervisor {
            authority: self.authority.clone(),
            config: self.config.clone(),
            status: status_tx,
            reregister: reregister.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run(record));

        Ok(RegistrationHandle {
            service,
            watch: RegistrationWatch {
                status: status_rx,
                reregister,
            },
            cancel,
            task: Some(task),
        })
    }

    /// One bounded registration attempt, without retries
    pub async fn try_register(&self, record: &InstanceRecord) -> Result<(), RegistrationError> {
        record.validate()?;
        with_timeout(self.config.register_timeout, self.authority.register(record)).await?;
        Ok(())
    }

    /// Stop the registration task and deregister, best effort
    pub async fn deregister(&self, handle: RegistrationHandle) {
        handle.shutdown().await;
    }
}

struct Supervisor {
    authority: Arc<dyn Authority>,
    config: RegistrarConfig,
    status: watch::Sender<RegistrationStatus>,
    reregister: Arc<Notify>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self, mut record: InstanceRecord) {
        loop {
            if !self.register_until_success(&record).await {
                self.deregister(&record).await;
                return;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.deregister(&record).await;
                    return;
                }
                _ = self.reregister.notified() => {
                    let previous = record.instance_id;
                    record.instance_id = InstanceId::generate();
                    info!(
                        service = %record.service,
                        previous = %previous,
                        instance = %record.instance_id,
                        "Re-registering instance"
                    );
                }
            }
        }
    }

    /// Returns false if cancelled before registration succeeded
    async fn register_until_success(&self, record: &InstanceRecord) -> bool {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.status.send_replace(RegistrationStatus::Registering { attempt });

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                outcome = with_timeout(self.config.register_timeout, self.authority.register(record)) => outcome,
            };

            let err = match outcome {
                Ok(()) => {
                    info!(
                        service = %record.service,
                        instance = %record.instance_id,
                        attempts = attempt,
                        "Registered {}:{}",
                        record.address,
                        record.port
                    );
                    self.status.send_replace(RegistrationStatus::Registered(record.instance_id));
                    return true;
                }
                Err(e) => e,
            };

            let delay = self.config.backoff.delay(attempt - 1);
            if matches!(err, AuthorityError::Malformed(_)) {
                warn!(service = %record.service, error = %err, "Authority rejected registration as malformed");
            } else {
                warn!(
                    service = %record.service,
                    attempt,
                    error = %err,
                    "Registration failed, retrying in {:?}",
                    delay
                );
            }
            self.status.send_replace(RegistrationStatus::Degraded {
                attempts: attempt,
                last_error: err.to_string(),
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn deregister(&self, record: &InstanceRecord) {
        let attempted = !matches!(*self.status.borrow(), RegistrationStatus::Pending);
        if attempted {
            match with_timeout(
                self.config.deregister_timeout,
                self.authority.deregister(&record.instance_id),
            )
            .await
            {
                Ok(()) => info!(service = %record.service, instance = %record.instance_id, "Deregistered"),
                Err(e) => warn!(
                    service = %record.service,
                    instance = %record.instance_id,
                    error = %e,
                    "Deregistration failed"
                ),
            }
        }
        self.status.send_replace(RegistrationStatus::Deregistered);
    }
}

/// Read side of a registration, cheap to clone into other tasks
#[derive(Clone)]
pub struct RegistrationWatch {
    status: watch::Receiver<RegistrationStatus>,
    reregister: Arc<Notify>,
}

impl RegistrationWatch {
    pub fn status(&self) -> RegistrationStatus {
        self.status.borrow().clone()
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.status.borrow().instance_id()
    }

    pub fn is_registered(&self) -> bool {
        self.instance_id().is_some()
    }

    /// Ask the registration task to register again under a new instance id
    pub fn request_reregister(&self) {
        debug!("Re-registration requested");
        self.reregister.notify_one();
    }

    /// Wait until registered, up to `timeout`
    pub async fn wait_registered(&self, timeout: Duration) -> Option<InstanceId> {
        let mut status = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s, RegistrationStatus::Registered(_))),
        )
        .await;
        match waited {
            Ok(Ok(status)) => status.instance_id(),
            _ => None,
        }
    }
}

/// Owner of a running registration. Dropping it cancels the task, which
/// then deregisters; call [`RegistrationHandle::shutdown`] to wait for that.
pub struct RegistrationHandle {
    service: ServiceName,
    watch: RegistrationWatch,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RegistrationHandle {
    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn status(&self) -> RegistrationStatus {
        self.watch.status()
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.watch.instance_id()
    }

    pub fn watch(&self) -> RegistrationWatch {
        self.watch.clone()
    }

    pub async fn wait_registered(&self, timeout: Duration) -> Option<InstanceId> {
        self.watch.wait_registered(timeout).await
    }

    /// Cancel the task and wait for the best-effort deregistration
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(service = %self.service, "Registration task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
