use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::auth::{AuthSnapshot, SessionManager};
use crate::error::ApiError;

/// Which session token is sent as the bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerToken {
    Access,
    Id,
}

impl BearerToken {
    /// Pick the configured token out of a snapshot
    pub fn select(self, snapshot: &AuthSnapshot) -> Option<String> {
        match self {
            BearerToken::Access => snapshot.access_token().map(str::to_string),
            BearerToken::Id => snapshot
                .access_token()
                .and(snapshot.id_token())
                .map(str::to_string),
        }
    }
}

/// HTTP client for the Gestor REST API with retry logic.
///
/// The bearer header is read from the session signal on every attempt, so a
/// renewal between attempts is picked up without caching tokens here.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API base URL without trailing slash
    base_url: String,

    session: SessionManager,

    bearer: BearerToken,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        session: SessionManager,
        base_url: &str,
        bearer: BearerToken,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            bearer,
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(Method::GET, path, None).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.send_json(Method::POST, path, Some(body)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = encode(body)?;
        self.send_json(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(Method::DELETE, path, None).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, ApiError> {
        let text = self.send(method, path, body).await?;
        // Empty bodies (204, DELETE) decode as JSON null
        let text = if text.trim().is_empty() { "null" } else { &text };
        serde_json::from_str(text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Execute a request with retry logic
    /// Automatically handles:
    /// - 401/403: refreshes the session once and retries
    /// - 429: exponential backoff
    /// - 5xx and network errors: exponential backoff
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<String, ApiError> {
        let url = self.url(path);
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut attempt = 0;
        let mut refreshed = false;

        tracing::debug!(
            method = %method,
            url = %url,
            request_id = %request_id,
            "Sending API request"
        );

        loop {
            let Some(token) = self.bearer.select(&self.session.snapshot()) else {
                tracing::warn!(url = %url, "No bearer token available, request not sent");
                return Err(ApiError::Unauthenticated);
            };

            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(AUTHORIZATION, format!("Bearer {}", token))
                .header("X-Request-Id", &request_id);
            if let Some(body) = &body {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }

            tracing::debug!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                "Executing request attempt"
            );

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return response
                            .text()
                            .await
                            .map_err(|e| ApiError::InvalidResponse(e.to_string()));
                    }

                    match status.as_u16() {
                        // Token rejected: renew the session once and retry
                        401 | 403 if !refreshed => {
                            tracing::warn!(
                                status = %status,
                                "Bearer token rejected, refreshing session and retrying..."
                            );
                            refreshed = true;
                            match self.session.refresh().await {
                                Ok(()) => continue,
                                Err(e) => tracing::error!("Session refresh failed: {}", e),
                            }
                        }

                        // 429 or 5xx: Exponential backoff
                        429 | 500..=599 if attempt < self.max_retries => {
                            let delay = self.calculate_backoff_delay(attempt);
                            tracing::warn!(
                                "Received {}, retrying after {}ms (attempt {}/{})",
                                status,
                                delay,
                                attempt + 1,
                                self.max_retries
                            );

                            tokio::time::sleep(Duration::from_millis(delay)).await;
                            attempt += 1;
                            continue;
                        }

                        _ => {}
                    }

                    // Non-retryable error or max retries exceeded
                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        request_id = %request_id,
                        attempt = attempt + 1,
                        "API request failed with error response"
                    );
                    return Err(ApiError::from_status(status.as_u16(), &error_text));
                }

                Err(e) => {
                    let error_kind = error_kind(&e);
                    tracing::warn!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        "HTTP request error"
                    );

                    // Network error - retry with backoff
                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );

                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(ApiError::Network(format!("{} (kind: {})", e, error_kind)));
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // Exponential backoff: base_delay * 2^attempt
        // With jitter to avoid thundering herd
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Vec<u8>, ApiError> {
    serde_json::to_vec(body)
        .context("Failed to serialize request body")
        .map_err(ApiError::Internal)
}

/// Categorize a transport error for logs
fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}
