//! reqwest-backed [`ServerApi`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use dkcloud_common::{Error, ProviderConfig, Result};

use super::{ApiError, LogBody, ServerApi, ServerBody, ServerCreateBody};

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const API_KEY_HEADER: &str = "X-Api-Key";
const SERVERS_PATH: &str = "cloudservers";

/// Server API over HTTPS
#[derive(Clone, Debug)]
pub struct HttpServerApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpServerApi {
    /// Build a client for the configured endpoint
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(client: reqwest::Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            endpoint: config.api_endpoint().to_string(),
            api_key: config.api_key().to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.endpoint, path);
        debug!(method = %method, url = %url, "Store request");
        self.client
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(builder: RequestBuilder) -> std::result::Result<Response, ApiError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> std::result::Result<T, ApiError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn list_servers(&self, hostname: &str) -> std::result::Result<Vec<ServerBody>, ApiError> {
        let builder = self
            .request(Method::GET, SERVERS_PATH)
            .query(&[("hostname", hostname)]);
        Self::decode(Self::send(builder).await?).await
    }

    async fn get_server(&self, id: &str) -> std::result::Result<ServerBody, ApiError> {
        let builder = self.request(Method::GET, &format!("{SERVERS_PATH}/{id}"));
        Self::decode(Self::send(builder).await?).await
    }

    async fn create_server(
        &self,
        body: &ServerCreateBody,
    ) -> std::result::Result<ServerBody, ApiError> {
        let builder = self.request(Method::POST, SERVERS_PATH).json(body);
        Self::decode(Self::send(builder).await?).await
    }

    async fn delete_server(&self, id: &str) -> std::result::Result<(), ApiError> {
        let builder = self.request(Method::DELETE, &format!("{SERVERS_PATH}/{id}"));
        Self::send(builder).await.map(|_| ())
    }

    async fn list_server_logs(&self, id: &str) -> std::result::Result<Vec<LogBody>, ApiError> {
        let builder = self.request(Method::GET, &format!("{SERVERS_PATH}/{id}/logs"));
        Self::decode(Self::send(builder).await?).await
    }
}
