//! Edge request handling: route, buffer, dispatch

use crate::router::Router;
use discovery_proxy::http::{error_response, not_found_response, text_response};
use discovery_proxy::{Dispatch, MiddlewareContext, OutboundRequest, RequestContext};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, StatusCode};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Gateway {
    router: Router,
    dispatch: Arc<dyn Dispatch>,
}

impl Gateway {
    pub fn new(router: Router, dispatch: Arc<dyn Dispatch>) -> Self {
        Self { router, dispatch }
    }

    /// Forward one edge request to the service its route names
    pub async fn handle<B>(&self, req: Request<B>, context: &MiddlewareContext) -> Response<Bytes>
    where
        B: Body,
        B::Error: Display,
    {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let Some(route) = self.router.route(req.method().as_str(), &path_and_query) else {
            debug!(path = %path_and_query, "No route matched");
            return not_found_response(&path_and_query);
        };

        let mut request = match OutboundRequest::from_request(req).await {
            Ok(request) => request,
            Err(e) => {
                warn!(request_id = %context.request_id, "Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, format!("Failed to read request body: {}\n", e));
            }
        };
        request.path_and_query = route.upstream_path;

        let ctx = RequestContext::from_middleware(context);
        match self.dispatch.dispatch(&ctx, &route.service, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %context.request_id, service = %route.service, error = %e, "Dispatch failed");
                error_response(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteRule;
    use async_trait::async_trait;
    use discovery_api::ServiceName;
    use discovery_core::NotFoundError;
    use discovery_proxy::DispatchError;
    use http_body_util::Full;
    use hyper::header::RETRY_AFTER;
    use std::sync::Mutex;

    /// Records what it was asked to send and answers from `outcome`
    struct Recording {
        seen: Mutex<Vec<(String, String, Bytes)>>,
        outcome: fn(&ServiceName) -> Result<Response<Bytes>, DispatchError>,
    }

    #[async_trait]
    impl Dispatch for Recording {
        async fn dispatch(
            &self,
            _ctx: &RequestContext,
            target: &ServiceName,
            request: OutboundRequest,
        ) -> Result<Response<Bytes>, DispatchError> {
            self.seen
                .lock()
                .unwrap()
                .push((target.to_string(), request.path_and_query.clone(), request.body.clone()));
            (self.outcome)(target)
        }
    }

    fn gateway(outcome: fn(&ServiceName) -> Result<Response<Bytes>, DispatchError>) -> (Gateway, Arc<Recording>) {
        let router = Router::new(vec![RouteRule {
            path: "/catalog/*".into(),
            service: "catalog".into(),
            methods: vec![],
            strip_prefix: true,
        }])
        .unwrap();
        let recording = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            outcome,
        });
        (Gateway::new(router, recording.clone()), recording)
    }

    fn request(method: &str, uri: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_to_routed_service() {
        let (gateway, recording) = gateway(|_| Ok(text_response(StatusCode::OK, "items")));
        let context = MiddlewareContext::new("POST", "/catalog/items");

        let response = gateway.handle(request("POST", "/catalog/items?page=2", "{}"), &context).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"items"));

        let seen = recording.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("catalog".to_string(), "/items?page=2".to_string(), Bytes::from_static(b"{}"))]
        );
    }

    #[tokio::test]
    async fn test_unrouted_path_is_not_dispatched() {
        let (gateway, recording) = gateway(|_| Ok(text_response(StatusCode::OK, "")));
        let context = MiddlewareContext::new("GET", "/inventory");

        let response = gateway.handle(request("GET", "/inventory", ""), &context).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(recording.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_is_retryable() {
        let (gateway, _) = gateway(|service| Err(NotFoundError::no_healthy_instances(service).into()));
        let context = MiddlewareContext::new("GET", "/catalog/items");

        let response = gateway.handle(request("GET", "/catalog/items", ""), &context).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_upstream_rejection_is_relayed() {
        let (gateway, _) = gateway(|service| {
            Err(DispatchError::Rejected {
                service: service.clone(),
                status: StatusCode::CONFLICT,
                response: text_response(StatusCode::CONFLICT, "version mismatch"),
            })
        });
        let context = MiddlewareContext::new("PUT", "/catalog/items/1");

        let response = gateway.handle(request("PUT", "/catalog/items/1", "{}"), &context).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.body(), &Bytes::from_static(b"version mismatch"));
    }
}
