//! Liveness and readiness answers backed by the health reporter

use crate::http::{json_response, text_response};
use discovery_api::HealthStatus;
use discovery_core::{HealthReporter, Readiness};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

#[derive(Serialize)]
struct FailedCheck<'a> {
    check: &'a str,
    reason: &'a str,
}

#[derive(Serialize)]
struct LivenessBody<'a> {
    status: HealthStatus,
    failures: Vec<FailedCheck<'a>>,
}

/// `200` while every check passes, `503` with the failing checks otherwise
pub async fn liveness_response(reporter: &HealthReporter) -> Response<Bytes> {
    let report = reporter.check().await;
    let status = match report.status {
        HealthStatus::Pass => StatusCode::OK,
        HealthStatus::Fail => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = LivenessBody {
        status: report.status,
        failures: report
            .failures
            .iter()
            .map(|(check, reason)| FailedCheck { check, reason })
            .collect(),
    };
    json_response(status, &body)
}

pub async fn readiness_response(reporter: &HealthReporter) -> Response<Bytes> {
    match reporter.readiness().await {
        Readiness::Ready => text_response(StatusCode::OK, "ready\n"),
        Readiness::Starting => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting\n"),
    }
}
