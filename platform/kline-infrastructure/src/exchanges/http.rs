use kline_domain::errors::FetchError;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl HttpSettings {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            user_agent: None,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

pub fn build_client(settings: &HttpSettings) -> Result<Client, String> {
    let mut builder = Client::builder()
        .timeout(settings.timeout)
        .pool_idle_timeout(Duration::from_secs(90));
    if let Some(agent) = settings.user_agent.as_deref() {
        builder = builder.user_agent(agent.to_string());
    }
    builder
        .build()
        .map_err(|err| format!("failed to build http client: {err}"))
}

/// Maps a non-success status onto the adapter error taxonomy. `None` means success.
pub fn classify_status(status: StatusCode, retry_after: Option<&str>) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    let err = match code {
        429 | 418 => FetchError::RateLimited {
            retry_after: parse_retry_after(retry_after),
        },
        401 | 403 => FetchError::Auth(format!("status {code}")),
        400..=499 => FetchError::Protocol(format!("status {code}")),
        _ => FetchError::Network(format!("status {code}")),
    };
    Some(err)
}

/// `Retry-After` in whole seconds. HTTP-date forms and garbage fall back to one second.
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

pub fn classify_transport(err: &reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::Protocol(format!("failed to decode response: {err}"))
    } else if err.is_timeout() {
        FetchError::Network(format!("request timed out: {err}"))
    } else if err.is_connect() {
        FetchError::Network(format!("connect failed: {err}"))
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Sends one request and decodes the JSON body. No retries happen here.
pub async fn send_json<T: DeserializeOwned>(
    exchange: &'static str,
    request: RequestBuilder,
) -> Result<T, FetchError> {
    let started = Instant::now();
    let result = send_json_inner(request).await;
    metrics::histogram!("kline.fetch.http_ms", "exchange" => exchange)
        .record(started.elapsed().as_secs_f64() * 1000.0);
    let label = match &result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    metrics::counter!("kline.fetch.http_requests", "exchange" => exchange, "result" => label)
        .increment(1);
    result
}

async fn send_json_inner<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, FetchError> {
    let response = request.send().await.map_err(|err| classify_transport(&err))?;
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(err) = classify_status(status, retry_after.as_deref()) {
        tracing::debug!(status = status.as_u16(), kind = err.kind(), "exchange request rejected");
        return Err(err);
    }
    let body = response
        .bytes()
        .await
        .map_err(|err| classify_transport(&err))?;
    serde_json::from_slice(&body)
        .map_err(|err| FetchError::Protocol(format!("failed to decode response: {err}")))
}

pub(crate) fn opt_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn opt_i64(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn opt_u64(value: Option<&serde_json::Value>) -> Option<u64> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
