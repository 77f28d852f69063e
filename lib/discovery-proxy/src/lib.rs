//! Request dispatch to discovered services
//!
//! This library provides:
//! - A pooled HTTP forwarder behind the [`Transport`] trait
//! - The [`Dispatcher`], which resolves, forwards and retries
//! - A per-service circuit-breaker decorator
//! - Active HTTP health probing for the authority
//! - Middleware, metrics and trace propagation for the HTTP edge

pub mod dispatcher;
pub mod forwarder;
pub mod health_check;
pub mod health_endpoint;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod runtime;
pub mod server;
pub mod trace;

#[cfg(test)]
mod test_support;

pub use dispatcher::{
    Attempt, Dispatch, DispatchError, DispatchState, DispatchTrace, Dispatcher, RequestContext,
};
pub use forwarder::{OutboundRequest, RequestForwarder, Transport, TransportError};
pub use health_check::{HealthCheckMonitor, HealthChecker};
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareContext};
pub use policy::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerDispatch, CircuitState};
pub use trace::{TraceContext, TracingMiddleware};
