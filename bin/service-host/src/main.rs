use anyhow::{Context, Result};
use discovery_client::HttpAuthority;
use discovery_core::config;
use discovery_core::health::TcpListenerCheck;
use discovery_core::{Authority, DiscoveryConfig, HealthReporter, ProbeMode, Registrar, Resolver};
use discovery_proxy::runtime::{init_tracing, shutdown_signal};
use discovery_proxy::server::serve;
use discovery_proxy::{
    Dispatcher, LoggingMiddleware, MetricsCollector, MetricsMiddleware, MiddlewareChain,
    MiddlewareContext, RequestForwarder, TracingMiddleware,
};
use hyper::body::Incoming;
use hyper::Request;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod app;

use app::App;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config: DiscoveryConfig = config::load().context("Failed to load configuration")?;
    let identity = config.identity().context("Failed to determine instance identity")?;
    info!(service = %identity.service, "Starting service-host at {}", identity.endpoint());

    let addr: SocketAddr = format!("{}:{}", config.service.listen_address, config.service.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    // The listener check dials loopback when bound to the wildcard address
    let check_addr = if addr.ip().is_unspecified() {
        SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
    } else {
        addr
    };
    let descriptor = config.health.descriptor();
    let reporter = Arc::new(HealthReporter::new(descriptor.timeout).with_check(TcpListenerCheck::new(check_addr)));

    let authority: Arc<dyn Authority> =
        Arc::new(HttpAuthority::from_config(&config.authority).context("Invalid authority URL")?);

    let registrar = Registrar::new(authority.clone(), config.registrar.clone());
    let registration = registrar
        .register(identity.record(descriptor.clone()))
        .context("Registration record rejected")?;
    reporter.attach_registration(registration.watch());

    let shutdown = CancellationToken::new();
    let heartbeat = match config.health.mode {
        ProbeMode::Heartbeat => {
            info!("Pushing heartbeats every {:?}", descriptor.interval);
            Some(reporter.spawn_heartbeat(authority.clone(), registration.watch(), &descriptor, shutdown.child_token()))
        }
        ProbeMode::Http => {
            info!("Authority probes {} every {:?}", config.health.path, descriptor.interval);
            None
        }
    };

    let metrics = MetricsCollector::new().context("Failed to create metrics collector")?;
    let resolver = Arc::new(Resolver::new(authority, config.resolver.clone()));
    let dispatcher = Dispatcher::new(
        resolver.clone(),
        Arc::new(RequestForwarder::new(config.dispatch.request_timeout)),
        config.dispatch.clone(),
    )
    .with_metrics(metrics.clone());

    let app = Arc::new(App {
        identity: identity.clone(),
        reporter,
        resolver,
        dispatch: Arc::new(dispatcher),
        liveness_path: config.health.path.clone(),
        readiness_path: config.health.readiness_path.clone(),
    });

    let middleware = Arc::new(
        MiddlewareChain::new()
            .add(TracingMiddleware::with_service_name(identity.service.to_string()))
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics)),
    );

    let handler = move |req: Request<Incoming>, context: MiddlewareContext| {
        let app = app.clone();
        async move { app.handle(req, &context).await }
    };
    let server = tokio::spawn(serve(listener, middleware, handler, shutdown.clone()));

    shutdown_signal().await;

    // Deregister before the listener closes
    registration.shutdown().await;
    shutdown.cancel();

    if let Some(heartbeat) = heartbeat {
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
    }
    if let Err(e) = server.await {
        error!("HTTP server task failed: {}", e);
    }
    info!("service-host stopped");
    Ok(())
}
