//! Network operations used by the launch workflow.
//!
//! Two calls exist: an attribution pull (single attempt) and a destination
//! pull (retried per [`RetryPolicy`]). Neither touches workflow state; they
//! only return data or fail with a classified [`RemoteError`].

use std::future::Future;

use async_trait::async_trait;
use launch_gate_core::{
    AttributionRecord, ClientEnvironment, LaunchConfig, MergedRecord, RetryPolicy,
};
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rate limited (http 429)")]
    RateLimited,
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("malformed response body: {0}")]
    Decode(String),
    #[error("client configuration error: {0}")]
    Configuration(String),
}

impl RemoteError {
    /// Transport failures (timeout, DNS, connection) are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetches a fresh attribution snapshot for `device_id`.
    async fn pull_attribution(&self, device_id: &str) -> Result<AttributionRecord, RemoteError>;

    /// Resolves the destination URL for `merged`, retrying per policy.
    async fn pull_destination(&self, merged: &MergedRecord) -> Result<String, RemoteError>;
}

/// Runs `attempt` until it succeeds, fails hard, or the attempt budget is spent.
///
/// Transport errors wait `delay_for_slot(slot)` and advance the schedule.
/// A 429 waits `delay_for_slot(slot) * attempt` and keeps the schedule slot.
/// Both consume the attempt budget. Any other error is returned immediately.
///
/// # Errors
/// Returns the first non-retryable error, or the last error once
/// `policy.max_attempts` attempts have been made.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, RemoteError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut slot = 0_usize;
    let mut attempt_index = 1_u32;

    loop {
        let err = match attempt(attempt_index).await {
            Ok(value) => {
                tracing::debug!(operation, attempt = attempt_index, "remote call succeeded");
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() && !err.is_rate_limited() {
            tracing::warn!(operation, attempt = attempt_index, error = %err, "remote call failed hard");
            return Err(err);
        }

        if attempt_index >= max_attempts {
            tracing::warn!(
                operation,
                attempts = attempt_index,
                error = %err,
                "remote retry budget exhausted"
            );
            return Err(err);
        }

        let wait = if err.is_rate_limited() {
            policy.delay_for_slot(slot) * attempt_index
        } else {
            let wait = policy.delay_for_slot(slot);
            slot += 1;
            wait
        };

        tracing::info!(
            operation,
            attempt = attempt_index,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retrying remote call"
        );
        tokio::time::sleep(wait).await;
        attempt_index += 1;
    }
}

/// Request body for the destination call: the merged record plus environment
/// fields. Environment fields take precedence over same-named record keys.
#[must_use]
pub fn build_destination_payload(
    merged: &MergedRecord,
    environment: &ClientEnvironment,
) -> Map<String, Value> {
    let mut payload = merged.to_json_object();
    payload.insert(
        "platform".to_string(),
        Value::String(environment.platform.clone()),
    );
    payload.insert(
        "install_id".to_string(),
        Value::String(environment.install_id.clone()),
    );
    payload.insert(
        "bundle_id".to_string(),
        Value::String(environment.bundle_id.clone()),
    );
    payload.insert(
        "push_token".to_string(),
        environment
            .push_token
            .clone()
            .map_or(Value::Null, Value::String),
    );
    payload.insert("locale".to_string(), Value::String(environment.locale.clone()));
    payload
}

/// Extracts the destination from a configuration response body.
///
/// The body MUST be a JSON object with a non-empty string `url`; an explicit
/// `"ok": false` is treated as a malformed response.
///
/// # Errors
/// Returns [`RemoteError::Decode`] for any other shape.
pub fn parse_destination_body(body: &[u8]) -> Result<String, RemoteError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| RemoteError::Decode(format!("destination body is not JSON: {err}")))?;

    if value.get("ok").and_then(Value::as_bool) == Some(false) {
        return Err(RemoteError::Decode(
            "destination response reported ok=false".to_string(),
        ));
    }

    match value.get("url").and_then(Value::as_str).map(str::trim) {
        Some(url) if !url.is_empty() => Ok(url.to_string()),
        _ => Err(RemoteError::Decode(
            "destination response is missing url".to_string(),
        )),
    }
}

/// Decodes an attribution snapshot body into a record.
///
/// # Errors
/// Returns [`RemoteError::Decode`] when the body is not a JSON object.
pub fn parse_attribution_body(body: &[u8]) -> Result<AttributionRecord, RemoteError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| RemoteError::Decode(format!("attribution body is not JSON: {err}")))?;
    AttributionRecord::from_json_object(&value).map_err(|err| RemoteError::Decode(err.to_string()))
}

#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: Client,
    attribution_url: String,
    attribution_dev_key: Option<String>,
    destination_url: String,
    environment: ClientEnvironment,
    retry: RetryPolicy,
}

impl HttpRemoteClient {
    /// Builds a client from launch configuration.
    ///
    /// # Errors
    /// Returns [`RemoteError::Configuration`] when the HTTP client cannot be built.
    pub fn new(config: &LaunchConfig) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let client = Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .build()
            .map_err(|err| RemoteError::Configuration(err.to_string()))?;

        Ok(Self {
            client,
            attribution_url: config.attribution_url.clone(),
            attribution_dev_key: config.attribution_dev_key.clone(),
            destination_url: config.destination_url.clone(),
            environment: config.environment.clone(),
            retry: config.retry.clone(),
        })
    }

    async fn destination_attempt(&self, payload: &Value) -> Result<String, RemoteError> {
        let response = self
            .client
            .post(&self.destination_url)
            .json(payload)
            .send()
            .await
            .map_err(transport_error)?;

        let body = read_success_body(response).await?;
        parse_destination_body(&body)
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn pull_attribution(&self, device_id: &str) -> Result<AttributionRecord, RemoteError> {
        let mut query = vec![("device_id", device_id)];
        if let Some(dev_key) = self.attribution_dev_key.as_deref() {
            query.push(("devkey", dev_key));
        }

        let response = self
            .client
            .get(&self.attribution_url)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let body = read_success_body(response).await?;
        let record = parse_attribution_body(&body)?;
        tracing::info!(keys = record.len(), "pulled attribution snapshot");
        Ok(record)
    }

    async fn pull_destination(&self, merged: &MergedRecord) -> Result<String, RemoteError> {
        let payload = Value::Object(build_destination_payload(merged, &self.environment));
        let payload = &payload;
        retry_with_backoff(&self.retry, "pull_destination", move |_| {
            self.destination_attempt(payload)
        })
        .await
    }
}

async fn read_success_body(response: reqwest::Response) -> Result<Vec<u8>, RemoteError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RemoteError::RateLimited);
    }
    if !status.is_success() {
        return Err(RemoteError::Status(status.as_u16()));
    }
    let bytes = response.bytes().await.map_err(transport_error)?;
    Ok(bytes.to_vec())
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        return RemoteError::Decode(err.to_string());
    }
    RemoteError::Transport(err.to_string())
}
