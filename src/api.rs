//! Remote API seam used by the sync engine.
//!
//! Every write carries an `Idempotency-Key` equal to the queued record's id,
//! so a request that reached the server before the connection dropped is not
//! applied twice when it is replayed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;

use crate::auth::TokenStore;
use crate::config::SyncConfig;
use crate::mutation::EntityKind;
use crate::{AppError, AppResult};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("no authenticated session")]
    NoSession,
}

/// How the engine reacts to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry on a later pass.
    Transient,
    /// The request itself is wrong; only the user can retry it.
    Permanent,
    /// Stop the pass and leave the record pending.
    Unauthenticated,
}

impl ApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        ApiError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            ApiError::Network(_) | ApiError::Timeout => ErrorClass::Transient,
            ApiError::NoSession => ErrorClass::Unauthenticated,
            ApiError::Decode(_) => ErrorClass::Permanent,
            ApiError::Status { status, .. } => match *status {
                401 | 403 => ErrorClass::Unauthenticated,
                408 | 429 => ErrorClass::Transient,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if let Some(status) = err.status() {
            ApiError::status(status.as_u16(), err.to_string())
        } else if err.is_decode() || err.is_body() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        let code = match err.classify() {
            ErrorClass::Transient => "API/TRANSIENT",
            ErrorClass::Permanent => "API/REJECTED",
            ErrorClass::Unauthenticated => "AUTH/UNAUTHENTICATED",
        };
        let mut app = AppError::new(code, err.to_string());
        if let ApiError::Status { status, .. } = &err {
            app = app.with_context("status", status.to_string());
        }
        app
    }
}

/// A spooled photo ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoUpload {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Whether authenticated requests may be attempted at all.
    async fn has_session(&self) -> bool;

    /// Creates an entity and returns the server representation.
    async fn create(&self, kind: EntityKind, payload: &Value, key: &str)
        -> Result<Value, ApiError>;

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
        key: &str,
    ) -> Result<Value, ApiError>;

    async fn delete(&self, kind: EntityKind, id: &str, key: &str) -> Result<(), ApiError>;

    async fn upload_photo(
        &self,
        job_id: &str,
        upload: &PhotoUpload,
        key: &str,
    ) -> Result<(), ApiError>;

    /// Cheap reachability check used to feed the connectivity monitor.
    async fn probe(&self) -> bool;
}

/// Pulls the server-assigned id out of a create response. Accepts `{"id": ..}`
/// and `{"data": {"id": ..}}`, string or numeric.
pub fn remote_id_of(value: &Value) -> Option<String> {
    let id = value
        .get("id")
        .or_else(|| value.get("data").and_then(|d| d.get("id")))?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct HttpApiClient {
    client: Client,
    base_url: Url,
    tokens: TokenStore,
}

impl HttpApiClient {
    pub fn new(config: &SyncConfig, tokens: TokenStore) -> AppResult<Self> {
        Self::with_timeout(&config.api_url, config.request_timeout, tokens)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration, tokens: TokenStore) -> AppResult<Self> {
        let base_url = Url::parse(base_url.trim())
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                AppError::new("API/INVALID_BASE_URL", "API base URL is not a valid http(s) URL")
                    .with_context("url", base_url)
            })?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|err| {
                AppError::new("API/CLIENT_INIT", "Failed to build HTTP client")
                    .with_cause(AppError::from(err.to_string()))
            })?;
        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    /// Appends `segments` to the base URL, percent-encoding each one so ids
    /// cannot add path components or a query string.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authed(&self, method: Method, url: Url, key: &str) -> Result<RequestBuilder, ApiError> {
        let session = self
            .tokens
            .load_tokens()
            .ok()
            .flatten()
            .ok_or(ApiError::NoSession)?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(&session.access_token)
            .header(IDEMPOTENCY_HEADER, key))
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| status.to_string());
        Err(ApiError::status(status.as_u16(), truncate(&body, 512)))
    }

    async fn json_body(response: Response) -> Result<Value, ApiError> {
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body.to_string(),
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn has_session(&self) -> bool {
        self.tokens.has_valid_session()
    }

    async fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        key: &str,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(&["api", kind.collection()]);
        let response = self.authed(Method::POST, url, key)?.json(payload).send().await?;
        Self::json_body(Self::check(response).await?).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
        key: &str,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(&["api", kind.collection(), id]);
        let response = self.authed(Method::PATCH, url, key)?.json(payload).send().await?;
        Self::json_body(Self::check(response).await?).await
    }

    async fn delete(&self, kind: EntityKind, id: &str, key: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", kind.collection(), id]);
        let response = self.authed(Method::DELETE, url, key)?.send().await?;
        // Already gone is what we wanted.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn upload_photo(
        &self,
        job_id: &str,
        upload: &PhotoUpload,
        key: &str,
    ) -> Result<(), ApiError> {
        let part = reqwest::multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime)
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        let form = reqwest::multipart::Form::new().part("photo", part);
        let url = self.endpoint(&["api", EntityKind::Job.collection(), job_id, "photos"]);
        let response = self
            .authed(Method::POST, url, key)?
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn probe(&self) -> bool {
        match self.client.get(self.endpoint(&["health"])).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(err) => {
                tracing::debug!(target: "fieldsync", event = "probe_failed", error = %err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_statuses() {
        assert_eq!(ApiError::status(503, "").classify(), ErrorClass::Transient);
        assert_eq!(ApiError::status(429, "").classify(), ErrorClass::Transient);
        assert_eq!(ApiError::status(408, "").classify(), ErrorClass::Transient);
        assert_eq!(ApiError::status(401, "").classify(), ErrorClass::Unauthenticated);
        assert_eq!(ApiError::status(403, "").classify(), ErrorClass::Unauthenticated);
        assert_eq!(ApiError::status(422, "").classify(), ErrorClass::Permanent);
        assert_eq!(ApiError::status(409, "").classify(), ErrorClass::Permanent);
        assert_eq!(ApiError::Timeout.classify(), ErrorClass::Transient);
        assert_eq!(ApiError::Network("reset".into()).classify(), ErrorClass::Transient);
        assert_eq!(ApiError::Decode("eof".into()).classify(), ErrorClass::Permanent);
    }

    #[test]
    fn extracts_remote_ids() {
        assert_eq!(remote_id_of(&json!({"id": "o-9"})), Some("o-9".into()));
        assert_eq!(remote_id_of(&json!({"id": 17})), Some("17".into()));
        assert_eq!(remote_id_of(&json!({"data": {"id": "j-1"}})), Some("j-1".into()));
        assert_eq!(remote_id_of(&json!({"id": ""})), None);
        assert_eq!(remote_id_of(&Value::Null), None);
    }

    fn client(base: &str) -> HttpApiClient {
        HttpApiClient::with_timeout(
            base,
            Duration::from_secs(1),
            TokenStore::new("/nonexistent/session.json"),
        )
        .expect("client")
    }

    #[test]
    fn endpoint_escapes_ids() {
        let api = client("https://api.example.test/v2/");
        assert_eq!(
            api.endpoint(&["api", "orders", "42/../users"]).as_str(),
            "https://api.example.test/v2/api/orders/42%2F..%2Fusers"
        );
        assert_eq!(
            api.endpoint(&["api", "orders", "a?x=1"]).as_str(),
            "https://api.example.test/v2/api/orders/a%3Fx=1"
        );
        assert_eq!(
            client("http://127.0.0.1:9").endpoint(&["health"]).as_str(),
            "http://127.0.0.1:9/health"
        );
    }

    #[test]
    fn rejects_unusable_base_urls() {
        for base in ["not a url", "mailto:ops@example.test"] {
            let err = HttpApiClient::with_timeout(
                base,
                Duration::from_secs(1),
                TokenStore::new("/nonexistent/session.json"),
            )
            .err()
            .expect("invalid base");
            assert_eq!(err.code(), "API/INVALID_BASE_URL");
        }
    }

    #[test]
    fn api_errors_map_to_app_codes() {
        let app = AppError::from(ApiError::status(422, "bad field"));
        assert_eq!(app.code(), "API/REJECTED");
        assert_eq!(app.context().get("status").map(String::as_str), Some("422"));
        assert_eq!(AppError::from(ApiError::NoSession).code(), "AUTH/UNAUTHENTICATED");
    }
}
