//! HTTP+JSON client for the discovery authority

use async_trait::async_trait;
use discovery_api::v1::wire::{self, ErrorBody, HealthReport};
use discovery_api::{HealthStatus, InstanceId, InstanceRecord, ServiceName};
use discovery_core::config::AuthorityConfig;
use discovery_core::{Authority, AuthorityError, AuthorityResult};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// HttpAuthority talks to a discovery authority over its HTTP API
#[derive(Clone)]
pub struct HttpAuthority {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpAuthority {
    /// Create a client for the authority at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AuthorityResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &AuthorityConfig) -> AuthorityResult<Self> {
        Self::new(config.url.clone(), config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, err: reqwest::Error) -> AuthorityError {
        if err.is_timeout() {
            AuthorityError::Timeout(self.timeout)
        } else {
            AuthorityError::Unreachable(err.to_string())
        }
    }

    /// Turn a non-success response into an error
    async fn status_error(response: Response) -> AuthorityError {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        if status.is_server_error() {
            AuthorityError::Unreachable(format!("authority returned {}: {}", status, message))
        } else {
            AuthorityError::Rejected(format!("{}: {}", status, message))
        }
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn register(&self, record: &InstanceRecord) -> AuthorityResult<()> {
        let response = self
            .client
            .put(self.url(wire::INSTANCES_PATH))
            .json(record)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let body: wire::RegisterResponse = response
            .json()
            .await
            .map_err(|e| AuthorityError::Rejected(format!("invalid register response: {}", e)))?;
        if let Some(replaced) = body.replaced {
            debug!(instance = %body.instance_id, replaced = %replaced, "Authority replaced previous registration");
        }
        Ok(())
    }

    async fn deregister(&self, id: &InstanceId) -> AuthorityResult<()> {
        let response = self
            .client
            .delete(self.url(&wire::instance_path(id)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn query_healthy(&self, service: &ServiceName) -> AuthorityResult<Vec<InstanceRecord>> {
        let response = self
            .client
            .get(self.url(&wire::healthy_path(service.as_str())))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| AuthorityError::Rejected(format!("invalid instance list: {}", e)))
    }

    async fn report_health(&self, id: &InstanceId, status: HealthStatus) -> AuthorityResult<()> {
        let response = self
            .client
            .put(self.url(&wire::health_path(id)))
            .json(&HealthReport { status })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(AuthorityError::UnknownInstance(*id)),
            _ => Err(Self::status_error(response).await),
        }
    }
}
