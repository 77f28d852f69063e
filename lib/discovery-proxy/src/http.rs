//! HTTP responses for the edge: dispatch errors and plain replies

use crate::dispatcher::DispatchError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::debug;

/// Seconds a client is told to wait before retrying a transient failure
pub const RETRY_AFTER_SECS: u64 = 1;

pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Bytes> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode response: {}\n", e)),
    }
}

pub fn not_found_response(reason: &str) -> Response<Bytes> {
    text_response(StatusCode::NOT_FOUND, format!("Not Found: {}\n", reason))
}

fn retry_later(status: StatusCode, message: String) -> Response<Bytes> {
    let mut response = text_response(status, message);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    response
}

/// Map a dispatch failure to what the client sees.
///
/// A rejection relays the upstream's own response unchanged.
pub fn error_response(err: DispatchError) -> Response<Bytes> {
    debug!(outcome = err.outcome(), error = %err, "Mapping dispatch error");
    match err {
        DispatchError::DependencyUnavailable { transient: true, .. } => {
            retry_later(StatusCode::SERVICE_UNAVAILABLE, format!("Service Unavailable: {}\n", err))
        }
        DispatchError::DependencyUnavailable { .. } => {
            text_response(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}\n", err))
        }
        DispatchError::Timeout { .. } => {
            text_response(StatusCode::GATEWAY_TIMEOUT, format!("Gateway Timeout: {}\n", err))
        }
        DispatchError::Unreachable { .. } => {
            text_response(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}\n", err))
        }
        DispatchError::Rejected { response, .. } => response,
        DispatchError::CircuitOpen { .. } => {
            retry_later(StatusCode::SERVICE_UNAVAILABLE, format!("Service Unavailable: {}\n", err))
        }
        DispatchError::InvalidRequest(_) => {
            text_response(StatusCode::BAD_REQUEST, format!("Bad Request: {}\n", err))
        }
    }
}

/// Convert a buffered response into the body type hyper servers send
pub fn into_full(response: Response<Bytes>) -> Response<Full<Bytes>> {
    response.map(Full::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery_api::ServiceName;
    use discovery_core::NotFoundReason;
    use std::time::Duration;

    fn catalog() -> ServiceName {
        ServiceName::new("catalog").unwrap()
    }

    #[test]
    fn test_transient_unavailable_is_503_with_retry_after() {
        let response = error_response(DispatchError::DependencyUnavailable {
            service: catalog(),
            transient: true,
            reason: NotFoundReason::NoHealthyInstances,
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_permanent_unavailable_is_502() {
        let response = error_response(DispatchError::DependencyUnavailable {
            service: catalog(),
            transient: false,
            reason: NotFoundReason::NoHealthyInstances,
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_transport_failures() {
        let timeout = error_response(DispatchError::Timeout {
            service: catalog(),
            timeout: Duration::from_secs(10),
        });
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let unreachable = error_response(DispatchError::Unreachable {
            service: catalog(),
            message: "connection refused".into(),
        });
        assert_eq!(unreachable.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_rejection_relays_upstream_response() {
        let mut upstream = Response::new(Bytes::from_static(b"{\"error\":\"sku taken\"}"));
        *upstream.status_mut() = StatusCode::CONFLICT;
        upstream
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = error_response(DispatchError::Rejected {
            service: catalog(),
            status: StatusCode::CONFLICT,
            response: upstream,
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(response.body(), &Bytes::from_static(b"{\"error\":\"sku taken\"}"));
    }

    #[test]
    fn test_circuit_open_and_invalid_request() {
        let open = error_response(DispatchError::CircuitOpen { service: catalog() });
        assert_eq!(open.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(open.headers().contains_key(RETRY_AFTER));

        let invalid = error_response(DispatchError::InvalidRequest("bad uri".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_json_response() {
        let response = json_response(StatusCode::OK, &serde_json::json!({"status": "pass"}));
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(response.body(), &Bytes::from_static(b"{\"status\":\"pass\"}"));
        assert_eq!(not_found_response("no route").status(), StatusCode::NOT_FOUND);
    }
}
