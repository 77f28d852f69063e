//! Forwarding of buffered requests to a chosen endpoint

use async_trait::async_trait;
use discovery_api::Endpoint;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// A fully buffered request that can be sent more than once
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Create a new request with no headers and an empty body
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Create a new GET request
    pub fn get(path_and_query: impl Into<String>) -> Self {
        Self::new(Method::GET, path_and_query)
    }

    /// Add a header, replacing any previous value
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Buffer an inbound request
    pub async fn from_request<B>(request: Request<B>) -> Result<Self, B::Error>
    where
        B: Body,
    {
        let (parts, body) = request.into_parts();
        let body = body.collect().await?.to_bytes();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
        })
    }
}

/// Transport-level failure: the upstream never produced a response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Io(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Sends a request to one endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Response<Bytes>, TransportError>;
}

/// HTTP request forwarder with connection pooling and a per-request timeout
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    /// `timeout` bounds the whole exchange including the response body
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Response<Bytes>, TransportError> {
        let uri: Uri = endpoint
            .url(&request.path_and_query)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| TransportError::InvalidRequest(e.to_string()))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            copy_end_to_end_headers(&request.headers, headers);
            // The client sets Host from the target URI
            headers.remove(HOST);
        }
        let forwarded = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let response = self.client.request(forwarded).await.map_err(|e| {
            if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Io(e.to_string())
            }
        })?;

        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?
            .to_bytes();

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        copy_end_to_end_headers(&parts.headers, &mut headers);
        parts.headers = headers;

        debug!(
            endpoint = %endpoint.authority(),
            status = %parts.status,
            bytes = body.len(),
            "Upstream responded"
        );
        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl Transport for RequestForwarder {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &OutboundRequest,
    ) -> Result<Response<Bytes>, TransportError> {
        debug!(
            endpoint = %endpoint.authority(),
            method = %request.method,
            path = %request.path_and_query,
            "Forwarding request"
        );

        match tokio_timeout(self.timeout, self.exchange(endpoint, request)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!(endpoint = %endpoint.authority(), error = %e, "Upstream request failed");
                }
                result
            }
            Err(_) => {
                warn!(endpoint = %endpoint.authority(), timeout = ?self.timeout, "Upstream request timed out");
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }
}

fn copy_end_to_end_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Check if header is hop-by-hop (should not be forwarded)
pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
