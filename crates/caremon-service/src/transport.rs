//! HTTP transport used for live delivery and queue drains.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::debug;

use caremon_types::HttpMethod;

use crate::error::{DeliveryError, Result};

/// Sends one request to the backend and classifies the result.
///
/// `Ok` means a 2xx response. Failures to reach the server at all map to
/// [`DeliveryError::Connectivity`]; non-success statuses map through
/// [`DeliveryError::from_status`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, method: HttpMethod, url: &str, payload: Option<&serde_json::Value>) -> Result<()>;
}

/// [`Transport`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    api_token: Option<String>,
}

impl HttpTransport {
    pub fn new(timeout: Duration, api_token: Option<String>) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_token))
    }

    /// Create a transport with a custom reqwest Client.
    pub fn with_client(client: Client, api_token: Option<String>) -> Self {
        Self { client, api_token }
    }
}

fn to_reqwest(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, method: HttpMethod, url: &str, payload: Option<&serde_json::Value>) -> Result<()> {
        let mut request = self.client.request(to_reqwest(method), url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = payload
            && method.has_body()
        {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Connectivity(e.to_string()))?;

        let status = response.status();
        debug!(%method, url, status = status.as_u16(), "Backend responded");
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::from_status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(to_reqwest(HttpMethod::Post), Method::POST);
        assert_eq!(to_reqwest(HttpMethod::Delete), Method::DELETE);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connectivity_failure() {
        let transport = HttpTransport::new(Duration::from_secs(2), None).unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let err = transport
            .send(HttpMethod::Post, "http://127.0.0.1:9/api/v1/telemetry", None)
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
    }
}
