//! Request handling for a hosted service instance

use discovery_api::ServiceName;
use discovery_core::{HealthReporter, InstanceIdentity, Resolver};
use discovery_proxy::health_endpoint::{liveness_response, readiness_response};
use discovery_proxy::http::{error_response, json_response, text_response};
use discovery_proxy::{Dispatch, DispatchError, MiddlewareContext, OutboundRequest, RequestContext};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use std::fmt::Display;
use std::sync::Arc;
use tracing::warn;

/// Prefix under which requests are relayed to a peer service
pub const CALL_PREFIX: &str = "/call/";
/// Prefix under which resolutions are shown
pub const RESOLVE_PREFIX: &str = "/resolve/";

pub struct App {
    pub identity: InstanceIdentity,
    pub reporter: Arc<HealthReporter>,
    pub resolver: Arc<Resolver>,
    pub dispatch: Arc<dyn Dispatch>,
    pub liveness_path: String,
    pub readiness_path: String,
}

impl App {
    pub async fn handle<B>(&self, req: Request<B>, context: &MiddlewareContext) -> Response<Bytes>
    where
        B: Body,
        B::Error: Display,
    {
        let path = req.uri().path().to_string();

        if req.method() == Method::GET && path == self.liveness_path {
            return liveness_response(&self.reporter).await;
        }
        if req.method() == Method::GET && path == self.readiness_path {
            return readiness_response(&self.reporter).await;
        }
        if let Some(rest) = path.strip_prefix(RESOLVE_PREFIX) {
            return self.resolve(rest).await;
        }
        if path.starts_with(CALL_PREFIX) {
            return self.call(req, context).await;
        }

        text_response(
            StatusCode::OK,
            format!("{} at {}\n", self.identity.service, self.identity.endpoint()),
        )
    }

    async fn resolve(&self, name: &str) -> Response<Bytes> {
        let service = match ServiceName::new(name) {
            Ok(service) => service,
            Err(e) => return text_response(StatusCode::BAD_REQUEST, format!("{}\n", e)),
        };
        match self.resolver.resolve(&service).await {
            Ok(resolution) => json_response(StatusCode::OK, &resolution),
            Err(e) => error_response(e.into()),
        }
    }

    /// `/call/{service}/{path}` sends `/{path}` to some healthy instance of `service`
    async fn call<B>(&self, req: Request<B>, context: &MiddlewareContext) -> Response<Bytes>
    where
        B: Body,
        B::Error: Display,
    {
        let mut request = match OutboundRequest::from_request(req).await {
            Ok(request) => request,
            Err(e) => {
                return text_response(StatusCode::BAD_REQUEST, format!("Failed to read request body: {}\n", e));
            }
        };
        let (service, upstream_path) = match split_call(&request.path_and_query) {
            Ok(split) => split,
            Err(e) => return error_response(e),
        };
        request.path_and_query = upstream_path;

        let ctx = RequestContext::from_middleware(context);
        match self.dispatch.dispatch(&ctx, &service, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %context.request_id, target = %service, error = %e, "Peer call failed");
                error_response(e)
            }
        }
    }
}

fn split_call(path_and_query: &str) -> Result<(ServiceName, String), DispatchError> {
    let rest = path_and_query.strip_prefix(CALL_PREFIX).unwrap_or(path_and_query);
    let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
    let (name, tail) = rest.split_at(split_at);
    let service = ServiceName::new(name).map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
    let upstream = if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{}", tail)
    };
    Ok((service, upstream))
}
