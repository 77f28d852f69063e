//! W3C trace context propagation

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use std::collections::HashMap;
use std::fmt::Write;
use tracing::{error, info};

pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Metadata key holding the trace id of the current request
pub const TRACE_ID_KEY: &str = "trace_id";
/// Metadata key holding the `traceparent` value to send upstream
pub const OUTBOUND_TRACEPARENT_KEY: &str = "outbound_traceparent";

/// Parsed `traceparent` header: `00-<trace_id>-<span_id>-<flags>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub flags: String,
}

impl TraceContext {
    /// Start a new sampled trace
    pub fn generate() -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            flags: "01".to_string(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() || version != "00" {
            return None;
        }
        if !is_lower_hex(trace_id, 32) || !is_lower_hex(span_id, 16) || !is_lower_hex(flags, 2) {
            return None;
        }
        // All-zero ids are invalid
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags: flags.to_string(),
        })
    }

    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        headers.get(TRACEPARENT_HEADER).and_then(|v| Self::parse(v))
    }

    /// Same trace, new span
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
            flags: self.flags.clone(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("00-{}-{}-{}", self.trace_id, self.span_id, self.flags)
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn random_hex(bytes: usize) -> String {
    let mut id = String::with_capacity(bytes * 2);
    for _ in 0..bytes {
        write!(&mut id, "{:02x}", rand::random::<u8>()).ok();
    }
    id
}

/// Random 16 hex digit span id
pub fn generate_span_id() -> String {
    random_hex(8)
}

/// Random 32 hex digit trace id
pub fn generate_trace_id() -> String {
    random_hex(16)
}

/// Continues the caller's trace (or starts one) and records the
/// `traceparent` to forward upstream
pub struct TracingMiddleware {
    pub service_name: String,
}

impl TracingMiddleware {
    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "TracingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        let incoming = TraceContext::from_headers(&context.request_headers);
        let continued = incoming.is_some();
        let outbound = incoming.map_or_else(TraceContext::generate, |parent| parent.child());

        context.set_metadata(TRACE_ID_KEY, outbound.trace_id.clone());
        context.set_metadata(OUTBOUND_TRACEPARENT_KEY, outbound.header_value());

        info!(
            service = %self.service_name,
            trace_id = %outbound.trace_id,
            continued,
            method = %context.method,
            path = %context.path,
            "Request started"
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        let trace_id = context.get_metadata(TRACE_ID_KEY).unwrap_or_default();
        info!(
            service = %self.service_name,
            trace_id = %trace_id,
            status,
            path = %context.path,
            "Request finished"
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        let trace_id = context.get_metadata(TRACE_ID_KEY).unwrap_or_default();
        error!(
            service = %self.service_name,
            trace_id = %trace_id,
            error = %error,
            path = %context.path,
            "Request error"
        );
        Ok(())
    }
}
