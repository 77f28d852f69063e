use anyhow::{Context, Result};
use discovery_core::config::{self, HasDiscoveryConfig};
use discovery_core::{DiscoveryConfig, ServiceRegistry};
use discovery_proxy::http::{json_response, text_response};
use discovery_proxy::runtime::{init_tracing, shutdown_signal};
use discovery_proxy::server::serve;
use discovery_proxy::{
    HealthCheckMonitor, LoggingMiddleware, MetricsCollector, MetricsMiddleware, MiddlewareChain,
    MiddlewareContext, TracingMiddleware,
};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod api;

const LISTEN_PORT_ENV: &str = "DISCOVERY_LISTEN_PORT";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct AuthorityConfig {
    listen_address: String,
    listen_port: u16,
    /// How often the probe monitor looks for due probes
    #[serde(rename = "probe_tick_ms", with = "discovery_api::duration_ms")]
    probe_tick: Duration,
    #[serde(flatten)]
    discovery: DiscoveryConfig,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8500,
            probe_tick: Duration::from_millis(500),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl HasDiscoveryConfig for AuthorityConfig {
    fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    fn discovery_mut(&mut self) -> &mut DiscoveryConfig {
        &mut self.discovery
    }
}

#[derive(Serialize)]
struct Summary {
    services: usize,
    instances: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting discovery-authority...");

    let mut config: AuthorityConfig = config::load().context("Failed to load configuration")?;
    if let Ok(port) = std::env::var(LISTEN_PORT_ENV) {
        config.listen_port = port
            .parse()
            .with_context(|| format!("{}={} is not a port", LISTEN_PORT_ENV, port))?;
    }

    let registry = Arc::new(ServiceRegistry::with_config(config.discovery.registry.clone()));
    info!("Service registry initialized");

    let shutdown = CancellationToken::new();
    let monitor = Arc::new(HealthCheckMonitor::new(registry.clone(), config.probe_tick));
    let monitor_task = monitor.spawn(shutdown.child_token());
    info!("Health check monitor started (tick {:?})", config.probe_tick);

    let metrics = MetricsCollector::new().context("Failed to create metrics collector")?;
    let middleware = Arc::new(
        MiddlewareChain::new()
            .add(TracingMiddleware::with_service_name("discovery-authority"))
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics.clone())),
    );

    let addr: SocketAddr = format!("{}:{}", config.listen_address, config.listen_port)
        .parse()
        .context("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let handler = move |req: Request<Incoming>, _context: MiddlewareContext| {
        let registry = registry.clone();
        let metrics = metrics.clone();
        async move { handle_request(req, &registry, &metrics).await }
    };
    let server = tokio::spawn(serve(listener, middleware, handler, shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = server.await {
        error!("HTTP server task failed: {}", e);
    }
    if let Err(e) = monitor_task.await {
        error!("Health check monitor failed: {}", e);
    }
    info!("discovery-authority stopped");
    Ok(())
}

async fn handle_request(req: Request<Incoming>, registry: &ServiceRegistry, metrics: &MetricsCollector) -> Response<Bytes> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => {
            let summary = Summary {
                services: registry.service_count().await,
                instances: registry.instance_count().await,
            };
            json_response(StatusCode::OK, &summary)
        }
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(text) => text_response(StatusCode::OK, text),
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to gather metrics: {}\n", e)),
        },
        _ => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return text_response(StatusCode::BAD_REQUEST, format!("Failed to read body: {}\n", e));
                }
            };
            api::handle_api(registry, &method, &path, body).await
        }
    }
}
