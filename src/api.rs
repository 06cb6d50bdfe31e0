//! Authenticated request/response client for the message server.
//!
//! Every request carries the active session's bearer credential unless the
//! caller supplies one explicitly. A `401` from the server signs out the
//! session whose credential was sent.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::session::SessionStore;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Base URL of a local development server.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:20180";
/// Envelope `code` reported for successful requests.
pub const SUCCESS_CODE: i32 = 10000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(25);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: ApiDefaults::MAX_ATTEMPTS,
                initial_backoff: ApiDefaults::BACKOFF,
                max_backoff: ApiDefaults::BACKOFF,
            },
        }
    }
}

/// Server response envelope.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiResult<T> {
    pub code: Option<i32>,
    pub message: Option<String>,
    pub data: Option<T>,
    pub timestamp: Option<i64>,
}

impl<T> ApiResult<T> {
    pub fn is_success(&self) -> bool {
        self.code == Some(SUCCESS_CODE)
    }

    /// Returns the payload of a successful envelope.
    pub fn into_data(self) -> Result<T, ApiError> {
        if !self.is_success() {
            return Err(ApiError::Envelope {
                code: self.code,
                message: self.message.unwrap_or_else(|| "unknown failure".to_string()),
            });
        }
        self.data.ok_or(ApiError::EmptyData)
    }

    /// Returns the payload, or `default` for failed or empty envelopes.
    pub fn data_or(self, default: T) -> T {
        if self.is_success() {
            self.data.unwrap_or(default)
        } else {
            default
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("unauthorized; session signed out")]
    Unauthorized,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request rejected [{code:?}]: {message}")]
    Envelope { code: Option<i32>, message: String },

    #[error("response carried no data")]
    EmptyData,

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::Timeout(_) => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Unauthorized | Self::Envelope { .. } | Self::EmptyData | Self::Parse(_) => {
                false
            }
        }
    }

    /// Whether a request with `method` may be sent again after this error.
    ///
    /// Non-idempotent requests are only resent when the connection was never
    /// established, so the server cannot have acted on them.
    pub fn is_retryable_for(&self, method: &Method) -> bool {
        if is_idempotent(method) {
            return self.is_retryable();
        }
        matches!(self, Self::Transport(err) if err.is_connect())
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE
    )
}

/// Request client bound to one base URL and the shared session store.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    sessions: SessionStore,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, sessions: SessionStore) -> Result<Self, ApiError> {
        Self::with_options(base_url, sessions, ApiClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        sessions: SessionStore,
        options: ApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .build()
            .map_err(ApiError::Transport)?;
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            base_url,
            sessions,
            request_timeout: options.request_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResult<T>, ApiError> {
        self.request::<(), T>(Method::GET, path, None, None).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<ApiResult<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.request(Method::POST, path, Some(body), None).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<ApiResult<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.request(Method::PUT, path, Some(body), None).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResult<T>, ApiError> {
        self.request::<(), T>(Method::DELETE, path, None, None).await
    }

    /// Posts with an explicit bearer token instead of the active session's,
    /// e.g. when acting on behalf of another signed-in member.
    pub async fn post_as<B, T>(
        &self,
        path: &str,
        body: &B,
        token: &SecretString,
    ) -> Result<ApiResult<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.request(Method::POST, path, Some(body), Some(token)).await
    }

    pub async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get(path).await?.into_data()
    }

    pub async fn post_data<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.post(path, body).await?.into_data()
    }

    pub async fn put_data<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.put(path, body).await?.into_data()
    }

    pub async fn delete_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.delete(path).await?.into_data()
    }

    async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        explicit_token: Option<&SecretString>,
    ) -> Result<ApiResult<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let endpoint = self.endpoint(path);
        // Resolved once so a session switch mid-request cannot redirect a 401.
        let (session_id, session_token) = match explicit_token {
            Some(_) => (None, None),
            None => match self.sessions.get_active_session_id() {
                Some(session_id) => {
                    let token = self.sessions.credential_for(&session_id);
                    (token.is_some().then_some(session_id), token)
                }
                None => (None, None),
            },
        };
        let token = explicit_token.or(session_token.as_ref());

        let endpoint = endpoint.as_str();
        let method = &method;
        let session_id = session_id.as_deref();
        retry_async(
            &self.retry_policy,
            |_| async move {
                let attempt = self.send_attempt(method.clone(), endpoint, body, token, session_id);
                match with_timeout(self.request_timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ApiError::Timeout(self.request_timeout)),
                }
            },
            |err| err.is_retryable_for(method),
        )
        .await
    }

    async fn send_attempt<B, T>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
        token: Option<&SecretString>,
        session_id: Option<&str>,
    ) -> Result<ApiResult<T>, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        debug!(event = "api_request", method = %method, endpoint, authorized = token.is_some());
        let mut builder = self.http.request(method, endpoint);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;

        if status == StatusCode::UNAUTHORIZED {
            warn!(event = "api_unauthorized", endpoint, session_id);
            if let Some(session_id) = session_id {
                self.sessions.sign_out(session_id);
            }
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        serde_json::from_str(&text).map_err(|err| ApiError::Parse(err.to_string()))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::{Method, StatusCode};
    use serde_json::json;

    use super::{summarize_error_body, ApiClient, ApiError, ApiResult, SUCCESS_CODE};
    use crate::session::SessionStore;

    fn envelope(value: serde_json::Value) -> ApiResult<String> {
        serde_json::from_value(value).expect("envelope")
    }

    #[test]
    fn success_envelope_yields_data() {
        let result = envelope(json!({"code": SUCCESS_CODE, "message": "ok", "data": "tok"}));
        assert!(result.is_success());
        assert_eq!(result.into_data().expect("data"), "tok");
    }

    #[test]
    fn failed_envelope_reports_code_and_message() {
        let result = envelope(json!({"code": 40001, "message": "bad code"}));
        match result.into_data() {
            Err(ApiError::Envelope { code, message }) => {
                assert_eq!(code, Some(40001));
                assert_eq!(message, "bad code");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn success_without_data_is_empty() {
        let result = envelope(json!({"code": SUCCESS_CODE, "data": null, "timestamp": 1}));
        assert!(matches!(result.into_data(), Err(ApiError::EmptyData)));
    }

    #[test]
    fn data_or_falls_back_to_default() {
        let failed = envelope(json!({"code": 500}));
        assert_eq!(failed.data_or("fallback".to_string()), "fallback");

        let empty = envelope(json!({"code": SUCCESS_CODE}));
        assert_eq!(empty.data_or("fallback".to_string()), "fallback");
    }

    #[test]
    fn error_body_prefers_message_field() {
        assert_eq!(summarize_error_body(r#"{"message":"denied"}"#), "denied");
        assert_eq!(summarize_error_body("plain failure"), "plain failure");
        assert_eq!(summarize_error_body(&"x".repeat(500)).len(), 220);
    }

    #[test]
    fn retryable_statuses() {
        let status = |status| ApiError::HttpStatus {
            status,
            body: String::new(),
        };
        assert!(status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!ApiError::Unauthorized.is_retryable());
        assert!(ApiError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn non_idempotent_methods_skip_server_side_retries() {
        let bad_gateway = ApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        let timed_out = ApiError::Timeout(Duration::from_secs(1));

        assert!(bad_gateway.is_retryable_for(&Method::GET));
        assert!(bad_gateway.is_retryable_for(&Method::DELETE));
        assert!(!bad_gateway.is_retryable_for(&Method::POST));
        assert!(!bad_gateway.is_retryable_for(&Method::PUT));
        assert!(timed_out.is_retryable_for(&Method::GET));
        assert!(!timed_out.is_retryable_for(&Method::POST));
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        let client = ApiClient::new("http://localhost:20180/ ", SessionStore::in_memory())
            .expect("client");
        assert_eq!(client.base_url(), "http://localhost:20180");
        assert_eq!(client.endpoint("/auth/login"), "http://localhost:20180/auth/login");
        assert_eq!(client.endpoint("room/list"), "http://localhost:20180/room/list");
    }
}
