//! HTTP/1 accept loop shared by the binaries

use crate::http::into_full;
use crate::middleware::{MiddlewareChain, MiddlewareContext};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve `handler` on `listener` until `shutdown` is cancelled.
///
/// Every request runs through `middleware`; a 5xx answer is also reported
/// to the chain as an error.
pub async fn serve<H, Fut>(
    listener: TcpListener,
    middleware: Arc<MiddlewareChain>,
    handler: H,
    shutdown: CancellationToken,
) where
    H: Fn(Request<Incoming>, MiddlewareContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Bytes>> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on {}", addr);
    }

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("HTTP server stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            },
        };

        let middleware = middleware.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let middleware = middleware.clone();
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handle(req, middleware, handler).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle<H, Fut>(
    req: Request<Incoming>,
    middleware: Arc<MiddlewareChain>,
    handler: H,
) -> Response<Full<Bytes>>
where
    H: Fn(Request<Incoming>, MiddlewareContext) -> Fut,
    Fut: Future<Output = Response<Bytes>>,
{
    let context = MiddlewareContext::from_request(&req);
    if let Err(e) = middleware.on_request(&context).await {
        debug!("Middleware on_request error: {}", e);
    }

    let response = handler(req, context.clone()).await;
    let status = response.status();

    if status.is_server_error() {
        let reason = status.canonical_reason().unwrap_or("server error");
        if let Err(e) = middleware.on_error(&context, reason).await {
            debug!("Middleware on_error error: {}", e);
        }
    }
    if let Err(e) = middleware.on_response(&context, status.as_u16()).await {
        debug!("Middleware on_response error: {}", e);
    }

    into_full(response)
}
