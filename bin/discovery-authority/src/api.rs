//! HTTP+JSON API of the authority

use discovery_api::v1::wire::{ErrorBody, HealthReport, RegisterResponse, INSTANCES_PATH, SERVICES_PATH};
use discovery_api::{InstanceId, InstanceRecord, ServiceName};
use discovery_core::{AuthorityError, ServiceRegistry};
use discovery_proxy::http::{json_response, not_found_response, text_response};
use hyper::body::Bytes;
use hyper::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Register,
    ListInstances,
    Deregister(String),
    ReportHealth(String),
    Healthy(String),
    NotFound,
}

fn route(method: &Method, path: &str) -> Route {
    let path = path.trim_end_matches('/');
    if path == INSTANCES_PATH {
        return match *method {
            Method::PUT | Method::POST => Route::Register,
            Method::GET => Route::ListInstances,
            _ => Route::NotFound,
        };
    }
    if let Some(rest) = path.strip_prefix(INSTANCES_PATH).and_then(|r| r.strip_prefix('/')) {
        let segments: Vec<&str> = rest.split('/').collect();
        return match (method, segments.as_slice()) {
            (&Method::DELETE, [id]) => Route::Deregister(id.to_string()),
            (&Method::PUT, [id, "health"]) => Route::ReportHealth(id.to_string()),
            _ => Route::NotFound,
        };
    }
    if let Some(rest) = path.strip_prefix(SERVICES_PATH).and_then(|r| r.strip_prefix('/')) {
        let segments: Vec<&str> = rest.split('/').collect();
        return match (method, segments.as_slice()) {
            (&Method::GET, [name, "healthy"]) => Route::Healthy(name.to_string()),
            _ => Route::NotFound,
        };
    }
    Route::NotFound
}

fn error(status: StatusCode, message: impl Into<String>) -> Response<Bytes> {
    json_response(status, &ErrorBody { error: message.into() })
}

fn no_content() -> Response<Bytes> {
    text_response(StatusCode::NO_CONTENT, "")
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response<Bytes>> {
    serde_json::from_slice(body).map_err(|e| error(StatusCode::BAD_REQUEST, format!("invalid body: {}", e)))
}

fn parse_id(raw: &str) -> Result<InstanceId, Response<Bytes>> {
    raw.parse()
        .map_err(|_| error(StatusCode::BAD_REQUEST, format!("invalid instance id: {}", raw)))
}

/// Answer one `/v1` request against the registry
pub async fn handle_api(registry: &ServiceRegistry, method: &Method, path: &str, body: Bytes) -> Response<Bytes> {
    debug!(%method, path, "Authority API request");
    let result = match route(method, path) {
        Route::Register => register(registry, &body).await,
        Route::ListInstances => {
            let records: Vec<InstanceRecord> = registry
                .list_instances()
                .await
                .into_iter()
                .map(|e| e.record)
                .collect();
            Ok(json_response(StatusCode::OK, &records))
        }
        Route::Deregister(raw) => match parse_id(&raw) {
            Ok(id) => {
                registry.deregister_instance(&id).await;
                Ok(no_content())
            }
            Err(response) => Err(response),
        },
        Route::ReportHealth(raw) => report_health(registry, &raw, &body).await,
        Route::Healthy(name) => match ServiceName::new(name) {
            Ok(service) => Ok(json_response(StatusCode::OK, &registry.healthy_instances(&service).await)),
            Err(e) => Err(error(StatusCode::BAD_REQUEST, e.to_string())),
        },
        Route::NotFound => Err(not_found_response(path)),
    };
    result.unwrap_or_else(|response| response)
}

async fn register(registry: &ServiceRegistry, body: &Bytes) -> Result<Response<Bytes>, Response<Bytes>> {
    let record: InstanceRecord = decode(body)?;
    match registry.register_instance(record).await {
        Ok(outcome) => Ok(json_response(
            StatusCode::OK,
            &RegisterResponse {
                instance_id: outcome.instance_id,
                replaced: outcome.replaced,
            },
        )),
        Err(AuthorityError::Malformed(e)) => Err(error(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn report_health(registry: &ServiceRegistry, raw: &str, body: &Bytes) -> Result<Response<Bytes>, Response<Bytes>> {
    let id = parse_id(raw)?;
    let report: HealthReport = decode(body)?;
    match registry.record_check(&id, report.status).await {
        Ok(()) => Ok(no_content()),
        Err(AuthorityError::UnknownInstance(_)) => Err(error(StatusCode::NOT_FOUND, format!("unknown instance {}", id))),
        Err(e) => Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}
