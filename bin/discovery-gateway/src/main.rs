use anyhow::{Context, Result};
use discovery_client::HttpAuthority;
use discovery_core::config::{self, HasDiscoveryConfig};
use discovery_core::{DiscoveryConfig, Resolver};
use discovery_proxy::http::text_response;
use discovery_proxy::runtime::{init_tracing, shutdown_signal};
use discovery_proxy::server::serve;
use discovery_proxy::{
    CircuitBreakerConfig, CircuitBreakerDispatch, Dispatcher, LoggingMiddleware, MetricsCollector,
    MetricsMiddleware, MiddlewareChain, MiddlewareContext, RequestForwarder, TracingMiddleware,
};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod gateway;
mod router;

use gateway::Gateway;
use router::{RouteRule, Router};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    routes: Vec<RouteRule>,
    circuit_breaker: CircuitBreakerConfig,
    #[serde(flatten)]
    discovery: DiscoveryConfig,
}

impl HasDiscoveryConfig for GatewayConfig {
    fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    fn discovery_mut(&mut self) -> &mut DiscoveryConfig {
        &mut self.discovery
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting discovery-gateway...");

    let config: GatewayConfig = config::load().context("Failed to load configuration")?;
    let discovery = &config.discovery;

    let authority = Arc::new(HttpAuthority::from_config(&discovery.authority).context("Invalid authority URL")?);
    info!("Authority client initialized for {}", authority.base_url());

    let resolver = Arc::new(Resolver::new(authority, discovery.resolver.clone()));
    info!(
        "Resolver initialized (cache ttl {:?}, strategy {:?})",
        discovery.resolver.cache_ttl, discovery.resolver.strategy
    );

    let forwarder = Arc::new(RequestForwarder::new(discovery.dispatch.request_timeout));
    info!("Request forwarder initialized with {:?} timeout", discovery.dispatch.request_timeout);

    let metrics = MetricsCollector::new().context("Failed to create metrics collector")?;

    let dispatcher = Dispatcher::new(resolver, forwarder, discovery.dispatch.clone()).with_metrics(metrics.clone());
    let dispatch = Arc::new(CircuitBreakerDispatch::new(dispatcher, config.circuit_breaker.clone()));
    info!(
        "Circuit breaker: failure threshold {}, open for {:?}",
        config.circuit_breaker.failure_threshold, config.circuit_breaker.timeout
    );

    let router = Router::new(config.routes.clone()).context("Invalid route table")?;
    info!("Router initialized with {} routes", router.len());
    let gateway = Arc::new(Gateway::new(router, dispatch));

    let middleware = Arc::new(
        MiddlewareChain::new()
            .add(TracingMiddleware::with_service_name("discovery-gateway"))
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics.clone())),
    );
    info!("Middleware chain initialized with tracing, logging and metrics");

    let addr: SocketAddr = format!("{}:{}", discovery.service.listen_address, discovery.service.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let shutdown = CancellationToken::new();
    let handler = move |req: Request<Incoming>, context: MiddlewareContext| {
        let gateway = gateway.clone();
        let metrics = metrics.clone();
        async move { handle_request(req, context, &gateway, &metrics).await }
    };
    let server = tokio::spawn(serve(listener, middleware, handler, shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = server.await {
        error!("HTTP server task failed: {}", e);
    }
    info!("discovery-gateway stopped");
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: MiddlewareContext,
    gateway: &Gateway,
    metrics: &MetricsCollector,
) -> Response<Bytes> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "OK\n"),
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(text) => text_response(StatusCode::OK, text),
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to gather metrics: {}\n", e)),
        },
        _ => gateway.handle(req, &context).await,
    }
}
