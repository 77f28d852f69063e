//! Prometheus metrics for HTTP traffic and discovery

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use prometheus::{Counter, CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Prometheus metrics collector; clones share the same registry
#[derive(Clone)]
pub struct MetricsCollector {
    /// Total HTTP requests received
    pub http_requests_total: CounterVec,
    /// HTTP request duration in seconds
    pub http_request_duration_seconds: HistogramVec,
    /// HTTP responses by status code
    pub http_responses_total: CounterVec,
    /// HTTP errors total
    pub http_errors_total: Counter,
    /// Resolutions by service and outcome (fresh, stale, not_found)
    pub resolve_total: CounterVec,
    /// Dispatches by service and outcome
    pub dispatch_total: CounterVec,
    /// Dispatch duration in seconds, retries included
    pub dispatch_duration_seconds: HistogramVec,
    /// Retries onto another instance by service
    pub dispatch_retries_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "path"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            Opts::new("http_request_duration_seconds", "HTTP request latency in seconds").into(),
            &["method", "path"],
        )?;

        let http_responses_total = CounterVec::new(
            Opts::new("http_responses_total", "Total HTTP responses by status"),
            &["status"],
        )?;

        let http_errors_total = Counter::new("http_errors_total", "Total HTTP errors")?;

        let resolve_total = CounterVec::new(
            Opts::new("discovery_resolve_total", "Service name resolutions by outcome"),
            &["service", "outcome"],
        )?;

        let dispatch_total = CounterVec::new(
            Opts::new("discovery_dispatch_total", "Dispatched requests by outcome"),
            &["service", "outcome"],
        )?;

        let dispatch_duration_seconds = HistogramVec::new(
            Opts::new("discovery_dispatch_duration_seconds", "Dispatch latency in seconds").into(),
            &["service"],
        )?;

        let dispatch_retries_total = CounterVec::new(
            Opts::new("discovery_dispatch_retries_total", "Dispatches retried on another instance"),
            &["service"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_responses_total.clone()))?;
        registry.register(Box::new(http_errors_total.clone()))?;
        registry.register(Box::new(resolve_total.clone()))?;
        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(dispatch_duration_seconds.clone()))?;
        registry.register(Box::new(dispatch_retries_total.clone()))?;

        Ok(Self {
            http_requests_total,
            http_request_duration_seconds,
            http_responses_total,
            http_errors_total,
            resolve_total,
            dispatch_total,
            dispatch_duration_seconds,
            dispatch_retries_total,
            registry,
        })
    }

    /// Record one resolution outcome
    pub fn record_resolve(&self, service: &str, outcome: &str) {
        self.resolve_total.with_label_values(&[service, outcome]).inc();
    }

    /// Record a finished dispatch and how long it took
    pub fn record_dispatch(&self, service: &str, outcome: &str, elapsed: Duration) {
        self.dispatch_total.with_label_values(&[service, outcome]).inc();
        self.dispatch_duration_seconds
            .with_label_values(&[service])
            .observe(elapsed.as_secs_f64());
    }

    /// Record a retry onto another instance
    pub fn record_retry(&self, service: &str) {
        self.dispatch_retries_total.with_label_values(&[service]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Records request counts, statuses and latency
pub struct MetricsMiddleware {
    pub collector: MetricsCollector,
}

impl MetricsMiddleware {
    /// Create a new metrics middleware recording into `collector`
    pub fn new(collector: MetricsCollector) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        self.collector
            .http_requests_total
            .with_label_values(&[&context.method, &context.path])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        debug!("Recording response metrics for {} {} -> {}", context.method, context.path, status);

        self.collector
            .http_responses_total
            .with_label_values(&[&status.to_string()])
            .inc();
        self.collector
            .http_request_duration_seconds
            .with_label_values(&[&context.method, &context.path])
            .observe(context.elapsed().as_secs_f64());
        Ok(())
    }

    async fn on_error(&self, _context: &MiddlewareContext, _error: &str) -> Result<()> {
        self.collector.http_errors_total.inc();
        Ok(())
    }
}
