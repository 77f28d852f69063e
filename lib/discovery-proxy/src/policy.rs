//! Circuit breaking for dispatched traffic

use crate::dispatcher::{Dispatch, DispatchError, RequestContext};
use crate::forwarder::OutboundRequest;
use async_trait::async_trait;
use dashmap::DashMap;
use discovery_api::ServiceName;
use hyper::body::Bytes;
use hyper::Response;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker states
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally
    Closed,
    /// Circuit is open - requests are rejected
    Open,
    /// Circuit is half-open - one trial request at a time is allowed
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Successes needed in half-open before closing
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial request
    #[serde(rename = "open_timeout_ms", with = "discovery_api::duration_ms")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker for preventing cascading failures
pub struct CircuitBreaker {
    state: AtomicU32,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    /// Start of the half-open trial currently in flight
    trial_started: Mutex<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU32::new(CircuitState::Closed as u32),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            trial_started: Mutex::new(None),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                self.end_trial();
                let success_count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if success_count >= self.config.success_threshold {
                    debug!("Circuit breaker: Closing circuit after {} successes", success_count);
                    self.state.store(CircuitState::Closed as u32, Ordering::SeqCst);
                    self.failure_count.store(0, Ordering::SeqCst);
                    self.success_count.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failure_count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failure_count >= self.config.failure_threshold {
                    debug!("Circuit breaker: Opening circuit after {} failures", failure_count);
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                debug!("Circuit breaker: Opening circuit - failure during half-open");
                self.open();
            }
            CircuitState::Open => {}
        }
    }

    /// The request ended without saying anything about the upstream's health.
    /// A half-open trial is handed to the next request.
    pub fn record_inconclusive(&self) {
        if self.state() == CircuitState::HalfOpen {
            self.end_trial();
        }
    }

    /// Whether a request may go through. An open circuit turns half-open
    /// once its timeout has passed; half-open admits a single trial, and a
    /// trial that never reports back is abandoned after the same timeout.
    pub fn can_attempt(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.begin_trial(),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .ok()
                    .and_then(|opened| opened.map(|at| at.elapsed()));
                match elapsed {
                    Some(elapsed) if elapsed >= self.config.timeout => {
                        self.try_half_open();
                        self.begin_trial()
                    }
                    _ => false,
                }
            }
        }
    }

    /// Attempt to transition from Open to HalfOpen
    pub fn try_half_open(&self) {
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u32,
                CircuitState::HalfOpen as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            debug!("Circuit breaker: Transitioning to half-open");
            self.success_count.store(0, Ordering::SeqCst);
        }
    }

    fn begin_trial(&self) -> bool {
        let Ok(mut trial) = self.trial_started.lock() else {
            return false;
        };
        match *trial {
            Some(started) if started.elapsed() < self.config.timeout => false,
            _ => {
                *trial = Some(Instant::now());
                true
            }
        }
    }

    fn end_trial(&self) {
        if let Ok(mut trial) = self.trial_started.lock() {
            *trial = None;
        }
    }

    fn open(&self) {
        if let Ok(mut opened_at) = self.opened_at.lock() {
            *opened_at = Some(Instant::now());
        }
        self.end_trial();
        self.state.store(CircuitState::Open as u32, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
    }
}

/// Wraps a [`Dispatch`] with one circuit breaker per target service.
///
/// Only transport failures count against a circuit. A rejection proves the
/// upstream is reachable and a missing dependency never reached one, so it
/// only hands a half-open trial on.
pub struct CircuitBreakerDispatch<D> {
    inner: D,
    config: CircuitBreakerConfig,
    breakers: DashMap<ServiceName, Arc<CircuitBreaker>>,
}

impl<D: Dispatch> CircuitBreakerDispatch<D> {
    pub fn new(inner: D, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn state(&self, service: &ServiceName) -> CircuitState {
        self.breakers
            .get(service)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    fn breaker(&self, service: &ServiceName) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

#[async_trait]
impl<D: Dispatch> Dispatch for CircuitBreakerDispatch<D> {
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        target: &ServiceName,
        request: OutboundRequest,
    ) -> Result<Response<Bytes>, DispatchError> {
        let breaker = self.breaker(target);
        if !breaker.can_attempt() {
            debug!(service = %target, "Circuit open, rejecting dispatch");
            return Err(DispatchError::CircuitOpen {
                service: target.clone(),
            });
        }

        let result = self.inner.dispatch(ctx, target, request).await;
        match &result {
            Ok(_) | Err(DispatchError::Rejected { .. }) => breaker.record_success(),
            Err(e) if e.is_transport_failure() => {
                breaker.record_failure();
                if breaker.state() == CircuitState::Open {
                    warn!(service = %target, "Circuit opened");
                }
            }
            Err(_) => breaker.record_inconclusive(),
        }
        result
    }
}
