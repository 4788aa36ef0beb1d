//! Request/response transport over HTTP

use async_trait::async_trait;
use ragchat_core::config::BackendConfig;
use ragchat_core::session::SessionInfo;
use ragchat_core::{Error, Result};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Backend, History, IngestionSource, SendReply};
use crate::ingestion::IngestionStatus;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSession {
    session_id: String,
}

#[derive(Deserialize)]
struct Validation {
    valid: bool,
}

#[derive(Deserialize)]
struct SessionEnvelope {
    session: SessionInfo,
}

/// HTTP client for the backend's REST API
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a client with the configured timeout
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, config.api_base_url.clone()))
    }

    /// Wrap an existing client
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build an endpoint URL; segments are percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid API base URL {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("API base URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<String> {
        debug!(%method, %url, "backend call");
        let mut request = self.client.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::transport(Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(Error::transport(Some(status.as_u16()), text));
        }
        Ok(text)
    }

    /// Perform a call and decode the JSON response
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<T> {
        self.call_with_query(method, segments, &[], body).await
    }

    async fn call_with_query<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let url = self.url(segments)?;
        let text = self.send(method, url, query, body).await?;
        serde_json::from_str(&text).map_err(|e| {
            Error::Serialization(format!(
                "Unexpected response from {}: {}",
                segments.join("/"),
                e
            ))
        })
    }

    /// Perform a call whose response body is irrelevant
    async fn call_unit(&self, method: Method, segments: &[&str]) -> Result<()> {
        let url = self.url(segments)?;
        self.send(method, url, &[], None).await.map(|_| ())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_session(&self) -> Result<String> {
        let created: CreatedSession = self.call(Method::POST, &["sessions", "create"], None).await?;
        Ok(created.session_id)
    }

    async fn validate_session(&self, session_id: &str) -> Result<bool> {
        let validation: Validation = self
            .call(Method::GET, &["sessions", session_id, "validate"], None)
            .await?;
        Ok(validation.valid)
    }

    async fn session_info(&self, session_id: &str) -> Result<SessionInfo> {
        let envelope: SessionEnvelope = self.call(Method::GET, &["sessions", session_id], None).await?;
        Ok(envelope.session)
    }

    async fn get_history(&self, session_id: &str, limit: u32) -> Result<History> {
        self.call_with_query(
            Method::GET,
            &["chat", "history", session_id],
            &[("limit", limit.to_string())],
            None,
        )
        .await
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.call_unit(Method::POST, &["sessions", session_id, "clear"])
            .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.call_unit(Method::DELETE, &["sessions", session_id]).await
    }

    async fn send_message(&self, message: &str, session_id: Option<&str>) -> Result<SendReply> {
        let mut body = json!({ "message": message });
        if let Some(id) = session_id {
            body["sessionId"] = Value::String(id.to_string());
        }
        self.call(Method::POST, &["chat", "message"], Some(&body)).await
    }

    async fn health(&self) -> Result<Value> {
        self.call(Method::GET, &["health"], None).await
    }
}

#[async_trait]
impl IngestionSource for HttpBackend {
    async fn ingestion_status(&self) -> Result<IngestionStatus> {
        self.call(Method::GET, &["news", "status"], None).await
    }

    async fn trigger_ingestion(&self) -> Result<()> {
        self.call_unit(Method::POST, &["news", "update"]).await
    }
}
