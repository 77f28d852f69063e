//! Middleware framework for extensible request/response processing

use crate::trace::generate_span_id;
use anyhow::Result;
use hyper::Request;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, span, Instrument, Level};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Context passed through middleware chain
#[derive(Clone)]
pub struct MiddlewareContext {
    /// Taken from `x-request-id` when the client sent one
    pub request_id: String,
    /// Request path
    pub path: String,
    /// Request method
    pub method: String,
    /// Request headers, lowercased names
    pub request_headers: HashMap<String, String>,
    started: Instant,
    metadata: Arc<Mutex<HashMap<String, String>>>,
}

impl MiddlewareContext {
    /// Create a new middleware context without headers
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: generate_span_id(),
            path: path.into(),
            method: method.into(),
            request_headers: HashMap::new(),
            started: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a new middleware context from a request
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let mut context = Self::new(req.method().as_str(), req.uri().path());
        for (k, v) in req.headers() {
            if let Ok(v_str) = v.to_str() {
                context.request_headers.insert(k.to_string(), v_str.to_string());
            }
        }
        if let Some(id) = context.request_headers.get(REQUEST_ID_HEADER) {
            context.request_id = id.clone();
        }
        context
    }

    /// Add a request header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.request_headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Time since the request was received
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Get a metadata value
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().ok().and_then(|m| m.get(key).cloned())
    }

    /// Set a metadata value
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut m) = self.metadata.lock() {
            m.insert(key.into(), value.into());
        }
    }
}

/// Middleware trait for processing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before request is processed
    async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Called once the response status is known
    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) -> Result<()> {
        Ok(())
    }

    /// Called when the handler fails
    async fn on_error(&self, _context: &MiddlewareContext, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
#[derive(Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create a new middleware chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Process request through all middleware
    pub async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await?;
        }
        Ok(())
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, status).instrument(span).await?;
        }
        Ok(())
    }

    /// Process error through all middleware
    pub async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_error(context, error).instrument(span).await?;
        }
        Ok(())
    }
}

/// Logs every request with its outcome and latency
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!(
            request_id = %context.request_id,
            method = %context.method,
            path = %context.path,
            headers = context.request_headers.len(),
            "Request received"
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        info!(
            request_id = %context.request_id,
            method = %context.method,
            path = %context.path,
            status,
            elapsed_ms = context.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(())
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &str) -> Result<()> {
        debug!(request_id = %context.request_id, error = %error, "Request failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use hyper::body::Bytes;

    struct Recorder {
        label: &'static str,
    }

    #[async_trait::async_trait]
    impl Middleware for Recorder {
        async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
            let seen = context.get_metadata("order").unwrap_or_default();
            context.set_metadata("order", format!("{}{}", seen, self.label));
            Ok(())
        }

        async fn on_response(&self, context: &MiddlewareContext, _status: u16) -> Result<()> {
            let seen = context.get_metadata("order").unwrap_or_default();
            context.set_metadata("order", format!("{}{}", seen, self.label));
            Ok(())
        }
    }

    #[test]
    fn test_context_from_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/orders/42?x=1")
            .header("X-Request-Id", "req-7")
            .header("Content-Type", "application/json")
            .body(Empty::<Bytes>::new())
            .unwrap();

        let context = MiddlewareContext::from_request(&request);
        assert_eq!(context.method, "POST");
        assert_eq!(context.path, "/orders/42");
        assert_eq!(context.request_id, "req-7");
        assert_eq!(
            context.request_headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn test_request_id_generated_when_absent() {
        let a = MiddlewareContext::new("GET", "/");
        let b = MiddlewareContext::new("GET", "/");
        assert_eq!(a.request_id.len(), 16);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_metadata() {
        let context = MiddlewareContext::new("GET", "/test");
        context.set_metadata("key1", "value1");
        assert_eq!(context.get_metadata("key1"), Some("value1".to_string()));
        assert_eq!(context.get_metadata("key2"), None);

        // Clones share metadata
        let clone = context.clone();
        clone.set_metadata("key2", "value2");
        assert_eq!(context.get_metadata("key2"), Some("value2".to_string()));
    }

    #[tokio::test]
    async fn test_chain_order() {
        let chain = MiddlewareChain::new()
            .add(Recorder { label: "a" })
            .add(Recorder { label: "b" })
            .add(LoggingMiddleware);
        assert_eq!(chain.len(), 3);

        let context = MiddlewareContext::new("GET", "/test");
        chain.on_request(&context).await.unwrap();
        chain.on_response(&context, 200).await.unwrap();
        chain.on_error(&context, "boom").await.unwrap();

        assert_eq!(context.get_metadata("order"), Some("abba".to_string()));
    }
}
