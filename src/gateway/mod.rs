//! C1 Gateway Client: a typed façade over the external WhatsApp HTTP
//! gateway. The gateway owns the actual WhatsApp session; this client only
//! speaks its plain HTTP/JSON contract (§6).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited,
    #[error("gateway server error: {0}")]
    Server(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Network, RateLimited and Server are retriable by the caller; the
    /// others are not (§4.1 robustness contract).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::RateLimited | GatewayError::Server(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayChatKind {
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayChat {
    pub jid: String,
    pub name: String,
    pub kind: GatewayChatKind,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayMessage {
    pub id: String,
    pub sender_jid: String,
    pub is_from_me: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub content: String,
    pub media_type: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Clone)]
pub enum GatewayAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub base_url: String,
    pub auth: GatewayAuth,
}

pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    auth: GatewayAuth,
}

#[async_trait]
pub trait WhatsAppGateway: Send + Sync {
    async fn list_chats(&self) -> Result<Vec<GatewayChat>, GatewayError>;
    async fn fetch_messages(
        &self,
        chat_jid: &str,
        since_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<GatewayMessage>, GatewayError>;
    async fn send_text(&self, chat_jid: &str, text: &str) -> Result<String, GatewayError>;
    async fn download_media(&self, message_id: &str) -> Result<(Vec<u8>, String), GatewayError>;
}

impl GatewayClient {
    pub fn new(config: GatewayClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            GatewayAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            GatewayAuth::Bearer { token } => builder.bearer_auth(token),
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> GatewayError {
        match status.as_u16() {
            401 | 403 => GatewayError::Unauthorized,
            404 => GatewayError::NotFound(body.to_string()),
            429 => GatewayError::RateLimited,
            500..=599 => GatewayError::Server(format!("{status}: {body}")),
            _ => GatewayError::Malformed(format!("unexpected status {status}: {body}")),
        }
    }

    async fn send_request(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(Self::classify_status(status, &body))
        }
    }
}

#[async_trait]
impl WhatsAppGateway for GatewayClient {
    async fn list_chats(&self) -> Result<Vec<GatewayChat>, GatewayError> {
        let resp = self
            .send_request(self.client.get(format!("{}/chats", self.base_url)))
            .await?;
        resp.json::<Vec<GatewayChat>>()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    async fn fetch_messages(
        &self,
        chat_jid: &str,
        since_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<GatewayMessage>, GatewayError> {
        let url = format!(
            "{}/chats/{}/messages",
            self.base_url,
            urlencoding::encode(chat_jid)
        );
        let mut query = vec![("limit", limit.to_string())];
        if let Some(since) = since_id {
            query.push(("since", since.to_string()));
        }

        let resp = self
            .send_request(self.client.get(url).query(&query))
            .await?;
        resp.json::<Vec<GatewayMessage>>()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    async fn send_text(&self, chat_jid: &str, text: &str) -> Result<String, GatewayError> {
        let url = format!(
            "{}/chats/{}/send",
            self.base_url,
            urlencoding::encode(chat_jid)
        );
        let resp = self
            .send_request(self.client.post(url).json(&SendRequest { text }))
            .await?;
        let body: SendResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;
        Ok(body.id)
    }

    async fn download_media(&self, message_id: &str) -> Result<(Vec<u8>, String), GatewayError> {
        let url = format!(
            "{}/messages/{}/download",
            self.base_url,
            urlencoding::encode(message_id)
        );
        let resp = self.send_request(self.client.get(url)).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_server_and_rate_limit_are_retriable() {
        assert!(GatewayError::Network("x".into()).is_retriable());
        assert!(GatewayError::RateLimited.is_retriable());
        assert!(GatewayError::Server("x".into()).is_retriable());
    }

    #[test]
    fn unauthorized_not_found_malformed_are_not_retriable() {
        assert!(!GatewayError::Unauthorized.is_retriable());
        assert!(!GatewayError::NotFound("x".into()).is_retriable());
        assert!(!GatewayError::Malformed("x".into()).is_retriable());
    }

    #[test]
    fn classifies_status_codes() {
        assert!(matches!(
            GatewayClient::classify_status(reqwest::StatusCode::UNAUTHORIZED, ""),
            GatewayError::Unauthorized
        ));
        assert!(matches!(
            GatewayClient::classify_status(reqwest::StatusCode::NOT_FOUND, ""),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            GatewayClient::classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::RateLimited
        ));
        assert!(matches!(
            GatewayClient::classify_status(reqwest::StatusCode::BAD_GATEWAY, ""),
            GatewayError::Server(_)
        ));
    }
}
