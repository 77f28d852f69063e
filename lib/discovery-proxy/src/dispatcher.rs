//! Dispatch of requests to a logical service
//!
//! A dispatch resolves the target through the [`Resolver`], forwards the
//! request to the selected instance and maps the outcome. A transport
//! failure (timeout, refused or reset connection) is retried at most once,
//! on a different instance from the same resolution, and only when the
//! request is idempotent. An upstream that answers with a non-2xx status was
//! reachable, so its answer is returned as [`DispatchError::Rejected`] and
//! never retried.
//!
//! ```text
//! Resolving -> Resolved -> Forwarding -> Completed
//!                              |      -> Failed
//!                              `-> Retrying -> Forwarding -> ...
//! ```

use crate::forwarder::{OutboundRequest, Transport, TransportError};
use crate::metrics::MetricsCollector;
use crate::middleware::{MiddlewareContext, REQUEST_ID_HEADER};
use crate::trace::{OUTBOUND_TRACEPARENT_KEY, TRACEPARENT_HEADER};
use async_trait::async_trait;
use discovery_api::{Endpoint, InstanceId, ServiceName};
use discovery_core::{DispatchConfig, NotFoundError, NotFoundReason, Resolver};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{service} unavailable: {reason}")]
    DependencyUnavailable {
        service: ServiceName,
        transient: bool,
        reason: NotFoundReason,
    },

    #[error("{service} did not answer within {timeout:?}")]
    Timeout { service: ServiceName, timeout: Duration },

    #[error("{service} unreachable: {message}")]
    Unreachable { service: ServiceName, message: String },

    /// The upstream answered with a non-2xx status
    #[error("{service} rejected the request with {status}")]
    Rejected {
        service: ServiceName,
        status: StatusCode,
        response: Response<Bytes>,
    },

    #[error("circuit open for {service}")]
    CircuitOpen { service: ServiceName },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl DispatchError {
    fn from_transport(service: &ServiceName, err: TransportError) -> Self {
        match err {
            TransportError::Timeout(timeout) => DispatchError::Timeout {
                service: service.clone(),
                timeout,
            },
            TransportError::Connect(message) | TransportError::Io(message) => DispatchError::Unreachable {
                service: service.clone(),
                message,
            },
            TransportError::InvalidRequest(message) => DispatchError::InvalidRequest(message),
        }
    }

    /// The upstream never produced a response
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. } | DispatchError::Unreachable { .. })
    }

    /// Short label for logs and metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::DependencyUnavailable { .. } => "dependency_unavailable",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Unreachable { .. } => "unreachable",
            DispatchError::Rejected { .. } => "rejected",
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<NotFoundError> for DispatchError {
    fn from(err: NotFoundError) -> Self {
        DispatchError::DependencyUnavailable {
            service: err.service,
            transient: err.transient,
            reason: err.reason,
        }
    }
}

/// Per-request information that travels with a dispatch
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: Option<String>,
    /// `traceparent` to send upstream
    pub traceparent: Option<String>,
    /// Overrides the method-based idempotency decision
    pub idempotent: Option<bool>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_middleware(context: &MiddlewareContext) -> Self {
        Self {
            request_id: Some(context.request_id.clone()),
            traceparent: context.get_metadata(OUTBOUND_TRACEPARENT_KEY),
            idempotent: None,
        }
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Whether the request may safely be sent twice
    pub fn is_idempotent(&self, request: &OutboundRequest) -> bool {
        if let Some(explicit) = self.idempotent {
            return explicit;
        }
        matches!(
            request.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
        ) || request.headers.contains_key(IDEMPOTENCY_KEY_HEADER)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Resolving,
    Resolved,
    Forwarding,
    Retrying,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempt {
    pub instance_id: InstanceId,
    pub endpoint: Endpoint,
}

/// States a dispatch went through and the instances it tried, in order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchTrace {
    pub states: Vec<DispatchState>,
    pub attempts: Vec<Attempt>,
}

impl DispatchTrace {
    fn enter(&mut self, state: DispatchState) {
        self.states.push(state);
    }

    pub fn final_state(&self) -> Option<DispatchState> {
        self.states.last().copied()
    }

    pub fn retried(&self) -> bool {
        self.states.contains(&DispatchState::Retrying)
    }
}

/// Send a request to some healthy instance of `target`
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        target: &ServiceName,
        request: OutboundRequest,
    ) -> Result<Response<Bytes>, DispatchError>;
}

/// Dispatcher resolves, forwards and retries
pub struct Dispatcher {
    resolver: Arc<Resolver>,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    metrics: Option<MetricsCollector>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<Resolver>, transport: Arc<dyn Transport>, config: DispatchConfig) -> Self {
        Self {
            resolver,
            transport,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Dispatch and also return the trace of states and attempts
    pub async fn dispatch_traced(
        &self,
        ctx: &RequestContext,
        target: &ServiceName,
        request: OutboundRequest,
    ) -> (Result<Response<Bytes>, DispatchError>, DispatchTrace) {
        let started = Instant::now();
        let mut trace = DispatchTrace::default();
        let result = self.run(ctx, target, with_context_headers(ctx, request), &mut trace).await;

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "completed",
                Err(e) => e.outcome(),
            };
            metrics.record_dispatch(target.as_str(), outcome, started.elapsed());
        }
        debug!(service = %target, states = ?trace.states, attempts = trace.attempts.len(), "Dispatch finished");

        (result, trace)
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        target: &ServiceName,
        request: OutboundRequest,
        trace: &mut DispatchTrace,
    ) -> Result<Response<Bytes>, DispatchError> {
        trace.enter(DispatchState::Resolving);
        let resolution = match self.resolver.resolve(target).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.record_resolve(target, "not_found");
                trace.enter(DispatchState::Failed);
                return Err(e.into());
            }
        };
        if resolution.stale {
            debug!(service = %target, "Dispatching against a stale resolution");
            self.record_resolve(target, "stale");
        } else {
            self.record_resolve(target, "fresh");
        }
        trace.enter(DispatchState::Resolved);

        let may_retry = self.config.retry_on_transport_failure && ctx.is_idempotent(&request);
        let mut excluded: Vec<InstanceId> = Vec::new();

        loop {
            let Some(instance) = self.resolver.select(&resolution, &excluded) else {
                trace.enter(DispatchState::Failed);
                return Err(NotFoundError::no_healthy_instances(target).into());
            };

            trace.enter(DispatchState::Forwarding);
            let endpoint = instance.endpoint();
            trace.attempts.push(Attempt {
                instance_id: instance.instance_id,
                endpoint: endpoint.clone(),
            });

            let outcome = {
                let _in_flight = self.resolver.balancer().begin(instance.instance_id);
                self.transport.send(&endpoint, &request).await
            };

            let error = match outcome {
                Ok(response) if response.status().is_success() => {
                    trace.enter(DispatchState::Completed);
                    return Ok(response);
                }
                Ok(response) => {
                    trace.enter(DispatchState::Failed);
                    return Err(DispatchError::Rejected {
                        service: target.clone(),
                        status: response.status(),
                        response,
                    });
                }
                Err(e) => DispatchError::from_transport(target, e),
            };

            excluded.push(instance.instance_id);
            let alternative = resolution
                .instances
                .iter()
                .any(|i| !excluded.contains(&i.instance_id));

            if may_retry && error.is_transport_failure() && trace.attempts.len() == 1 && alternative {
                warn!(
                    service = %target,
                    instance = %instance.instance_id,
                    endpoint = %endpoint.authority(),
                    error = %error,
                    "Retrying on another instance"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_retry(target.as_str());
                }
                trace.enter(DispatchState::Retrying);
                continue;
            }

            warn!(service = %target, endpoint = %endpoint.authority(), error = %error, "Dispatch failed");
            trace.enter(DispatchState::Failed);
            return Err(error);
        }
    }

    fn record_resolve(&self, target: &ServiceName, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_resolve(target.as_str(), outcome);
        }
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(
        &self,
        ctx: &RequestContext,
        target: &ServiceName,
        request: OutboundRequest,
    ) -> Result<Response<Bytes>, DispatchError> {
        self.dispatch_traced(ctx, target, request).await.0
    }
}

fn with_context_headers(ctx: &RequestContext, mut request: OutboundRequest) -> OutboundRequest {
    let headers = [
        (TRACEPARENT_HEADER, ctx.traceparent.as_deref()),
        (REQUEST_ID_HEADER, ctx.request_id.as_deref()),
    ];
    for (name, value) in headers {
        let Some(value) = value else { continue };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                request.headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => debug!(header = name, "Dropping invalid header value"),
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_api::{HealthCheckDescriptor, HealthStatus, InstanceRecord};
    use discovery_core::{ResolverConfig, ServiceRegistry};
    use hyper::header::HeaderMap;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        Refuse,
        Slow,
        Status(u16),
    }

    /// Answers per port according to a script and records what it saw
    #[derive(Default)]
    struct ScriptedTransport {
        script: HashMap<u16, Behavior>,
        calls: Mutex<Vec<(u16, HeaderMap)>>,
    }

    impl ScriptedTransport {
        fn new(script: &[(u16, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                script: script.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn ports(&self) -> Vec<u16> {
            self.calls.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            endpoint: &Endpoint,
            request: &OutboundRequest,
        ) -> Result<Response<Bytes>, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.port, request.headers.clone()));
            match self.script.get(&endpoint.port).copied().unwrap_or(Behavior::Ok) {
                Behavior::Ok => Ok(Response::new(Bytes::from(format!("served by {}", endpoint.port)))),
                Behavior::Refuse => Err(TransportError::Connect("connection refused".into())),
                Behavior::Slow => Err(TransportError::Timeout(Duration::from_secs(10))),
                Behavior::Status(code) => {
                    let mut response = Response::new(Bytes::from_static(b"no"));
                    *response.status_mut() = StatusCode::from_u16(code).unwrap();
                    Ok(response)
                }
            }
        }
    }

    fn catalog() -> ServiceName {
        ServiceName::new("catalog").unwrap()
    }

    /// Registry with one passing instance per port, in port order
    async fn registry_with(ports: &[u16]) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        for port in ports {
            let record = InstanceRecord::new(catalog(), "10.0.0.1", *port, HealthCheckDescriptor::default());
            let id = record.instance_id;
            registry.register_instance(record).await.unwrap();
            registry.record_check(&id, HealthStatus::Pass).await.unwrap();
        }
        registry
    }

    async fn dispatcher(ports: &[u16], transport: Arc<ScriptedTransport>) -> Dispatcher {
        let registry = registry_with(ports).await;
        let resolver = Arc::new(Resolver::new(registry, ResolverConfig::default()));
        Dispatcher::new(resolver, transport, DispatchConfig::default())
    }

    fn body(response: &Response<Bytes>) -> String {
        String::from_utf8(response.body().to_vec()).unwrap()
    }

    use DispatchState::*;

    #[tokio::test]
    async fn test_completes_on_first_instance() {
        let transport = ScriptedTransport::new(&[]);
        let dispatcher = dispatcher(&[8081, 8082], transport.clone()).await;

        let (result, trace) = dispatcher
            .dispatch_traced(&RequestContext::new(), &catalog(), OutboundRequest::get("/items"))
            .await;

        assert_eq!(body(&result.unwrap()), "served by 8081");
        assert_eq!(trace.states, vec![Resolving, Resolved, Forwarding, Completed]);
        assert_eq!(transport.ports(), vec![8081]);
    }

    #[tokio::test]
    async fn test_transport_failure_retries_other_instance_once() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Refuse)]);
        let dispatcher = dispatcher(&[8081, 8082], transport.clone()).await;

        let (result, trace) = dispatcher
            .dispatch_traced(&RequestContext::new(), &catalog(), OutboundRequest::get("/items"))
            .await;

        assert_eq!(body(&result.unwrap()), "served by 8082");
        assert_eq!(
            trace.states,
            vec![Resolving, Resolved, Forwarding, Retrying, Forwarding, Completed]
        );
        let ports: Vec<u16> = trace.attempts.iter().map(|a| a.endpoint.port).collect();
        assert_eq!(ports, vec![8081, 8082]);
        assert_eq!(transport.ports(), vec![8081, 8082]);
    }

    #[tokio::test]
    async fn test_at_most_one_retry() {
        let transport = ScriptedTransport::new(&[
            (8081, Behavior::Refuse),
            (8082, Behavior::Slow),
            (8083, Behavior::Ok),
        ]);
        let dispatcher = dispatcher(&[8081, 8082, 8083], transport.clone()).await;

        let (result, trace) = dispatcher
            .dispatch_traced(&RequestContext::new(), &catalog(), OutboundRequest::get("/"))
            .await;

        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
        assert_eq!(transport.ports(), vec![8081, 8082]);
        assert_eq!(trace.final_state(), Some(Failed));
    }

    #[tokio::test]
    async fn test_no_retry_without_alternative() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Refuse)]);
        let dispatcher = dispatcher(&[8081], transport.clone()).await;

        let (result, trace) = dispatcher
            .dispatch_traced(&RequestContext::new(), &catalog(), OutboundRequest::get("/"))
            .await;

        assert!(matches!(result, Err(DispatchError::Unreachable { .. })));
        assert!(!trace.retried());
        assert_eq!(transport.ports(), vec![8081]);
    }

    #[tokio::test]
    async fn test_non_idempotent_not_retried() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Refuse)]);
        let dispatcher = dispatcher(&[8081, 8082], transport.clone()).await;

        let request = OutboundRequest::new(Method::POST, "/orders").with_body("{}");
        let result = dispatcher.dispatch(&RequestContext::new(), &catalog(), request).await;

        assert!(matches!(result, Err(DispatchError::Unreachable { .. })));
        assert_eq!(transport.ports(), vec![8081]);
    }

    #[tokio::test]
    async fn test_idempotency_key_allows_retry() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Refuse)]);
        let dispatcher = dispatcher(&[8081, 8082], transport.clone()).await;

        let request = OutboundRequest::new(Method::POST, "/orders").with_header(
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
            HeaderValue::from_static("order-17"),
        );
        let result = dispatcher.dispatch(&RequestContext::new(), &catalog(), request).await;

        assert!(result.is_ok());
        assert_eq!(transport.ports(), vec![8081, 8082]);
    }

    #[tokio::test]
    async fn test_caller_can_mark_get_non_idempotent() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Slow)]);
        let dispatcher = dispatcher(&[8081, 8082], transport.clone()).await;

        let ctx = RequestContext::new().with_idempotent(false);
        let result = dispatcher.dispatch(&ctx, &catalog(), OutboundRequest::get("/")).await;

        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
        assert_eq!(transport.ports(), vec![8081]);
    }

    #[tokio::test]
    async fn test_retry_can_be_disabled() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Refuse)]);
        let registry = registry_with(&[8081, 8082]).await;
        let resolver = Arc::new(Resolver::new(registry, ResolverConfig::default()));
        let config = DispatchConfig {
            retry_on_transport_failure: false,
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(resolver, transport.clone(), config);

        let result = dispatcher.dispatch(&RequestContext::new(), &catalog(), OutboundRequest::get("/")).await;
        assert!(result.is_err());
        assert_eq!(transport.ports(), vec![8081]);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Status(500))]);
        let dispatcher = dispatcher(&[8081, 8082], transport.clone()).await;

        let (result, trace) = dispatcher
            .dispatch_traced(&RequestContext::new(), &catalog(), OutboundRequest::get("/"))
            .await;

        match result {
            Err(DispatchError::Rejected { status, response, .. }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body(&response), "no");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(trace.states, vec![Resolving, Resolved, Forwarding, Failed]);
        assert_eq!(transport.ports(), vec![8081]);
    }

    #[tokio::test]
    async fn test_unknown_service_is_dependency_unavailable() {
        let transport = ScriptedTransport::new(&[]);
        let dispatcher = dispatcher(&[], transport.clone()).await;

        let (result, trace) = dispatcher
            .dispatch_traced(&RequestContext::new(), &catalog(), OutboundRequest::get("/"))
            .await;

        match result {
            Err(DispatchError::DependencyUnavailable { service, transient, reason }) => {
                assert_eq!(service, catalog());
                assert!(transient);
                assert_eq!(reason, NotFoundReason::NoHealthyInstances);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(trace.states, vec![Resolving, Failed]);
        assert!(transport.ports().is_empty());
    }

    #[tokio::test]
    async fn test_context_headers_forwarded() {
        let transport = ScriptedTransport::new(&[]);
        let dispatcher = dispatcher(&[8081], transport.clone()).await;

        let ctx = RequestContext {
            request_id: Some("req-1".into()),
            traceparent: Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".into()),
            idempotent: None,
        };
        dispatcher.dispatch(&ctx, &catalog(), OutboundRequest::get("/")).await.unwrap();

        let calls = transport.calls.lock().unwrap();
        let headers = &calls[0].1;
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-1");
        assert_eq!(
            headers.get(TRACEPARENT_HEADER).unwrap(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let transport = ScriptedTransport::new(&[(8081, Behavior::Refuse)]);
        let metrics = MetricsCollector::new().unwrap();
        let dispatcher = dispatcher(&[8081, 8082], transport)
            .await
            .with_metrics(metrics.clone());

        dispatcher
            .dispatch(&RequestContext::new(), &catalog(), OutboundRequest::get("/"))
            .await
            .unwrap();

        let text = metrics.gather().unwrap();
        assert!(text.contains("discovery_dispatch_retries_total{service=\"catalog\"} 1"));
        assert!(text.contains("discovery_dispatch_total{outcome=\"completed\",service=\"catalog\"} 1"));
        assert!(text.contains("discovery_resolve_total{outcome=\"fresh\",service=\"catalog\"} 1"));
    }

    #[test]
    fn test_idempotency_rules() {
        let ctx = RequestContext::new();
        for method in [Method::GET, Method::HEAD, Method::OPTIONS, Method::TRACE, Method::PUT, Method::DELETE] {
            assert!(ctx.is_idempotent(&OutboundRequest::new(method, "/")));
        }
        assert!(!ctx.is_idempotent(&OutboundRequest::new(Method::POST, "/")));
        assert!(!ctx.is_idempotent(&OutboundRequest::new(Method::PATCH, "/")));
        assert!(RequestContext::new()
            .with_idempotent(true)
            .is_idempotent(&OutboundRequest::new(Method::POST, "/")));
    }
}
