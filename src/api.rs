//! Sheet webhook client.
//!
//! The ledger's backend of record is a spreadsheet behind an Apps Script
//! webhook. The engine only sees it as `call(action, params) -> JSON` through
//! the [`LedgerRpc`] trait; [`WebhookClient`] is the HTTP implementation.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{LedgerError, Result};

/// Default timeout for webhook requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque RPC boundary to the remote store.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn call(&self, action: &str, params: Value) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the webhook URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_webhook_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// A connection string is either raw JSON or URL-safe base64 of JSON:
/// `{"url": "...", "token": "..."}`.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .or_else(|| v.get("webhookUrl"))
                .and_then(Value::as_str)
                .map(normalize_webhook_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_token_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("token")
                .or_else(|| v.get("key"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error, timeout: Duration) -> LedgerError {
    if err.is_timeout() {
        return LedgerError::Timeout(timeout);
    }
    let message = if err.is_connect() {
        "cannot reach the ledger webhook".to_string()
    } else if err.is_builder() {
        "invalid webhook URL".to_string()
    } else {
        err.to_string()
    };
    LedgerError::Network {
        url: url.to_string(),
        message,
    }
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "webhook token rejected".to_string(),
        404 => "webhook deployment not found".to_string(),
        429 => "webhook quota exceeded".to_string(),
        s if s >= 500 => format!("webhook server error (HTTP {s})"),
        s => format!("unexpected response from webhook (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Response unwrapping
// ---------------------------------------------------------------------------

fn remote_message(resp: &Value) -> String {
    resp.get("error")
        .or_else(|| resp.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "success was not true".to_string())
}

fn is_success(resp: &Value) -> Option<bool> {
    match resp.get("success").or_else(|| resp.get("ok"))? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        _ => Some(false),
    }
}

/// Require `success: true` on a write response.
pub fn ensure_success(action: &str, resp: &Value) -> Result<()> {
    if !resp.is_object() {
        return Err(LedgerError::MalformedResponse {
            action: action.to_string(),
            detail: "response is not a JSON object".to_string(),
        });
    }
    if is_success(resp) == Some(true) {
        Ok(())
    } else {
        Err(LedgerError::RemoteRejection {
            action: action.to_string(),
            message: remote_message(resp),
        })
    }
}

/// Extract the row list from a read response. Accepted shapes:
/// `{success, rows}`, `{data: {rows}}`, `{data: [..]}` and a bare array.
pub fn unwrap_rows(action: &str, resp: &Value) -> Result<Vec<Value>> {
    if let Value::Array(rows) = resp {
        return Ok(rows.clone());
    }
    if !resp.is_object() {
        return Err(LedgerError::MalformedResponse {
            action: action.to_string(),
            detail: "response is not a JSON object".to_string(),
        });
    }
    if is_success(resp) == Some(false) {
        return Err(LedgerError::RemoteRejection {
            action: action.to_string(),
            message: remote_message(resp),
        });
    }

    let rows = resp
        .get("rows")
        .or_else(|| resp.get("data").and_then(|d| d.get("rows")))
        .or_else(|| resp.get("data").filter(|d| d.is_array()))
        .or_else(|| resp.get("items"));

    match rows {
        Some(Value::Array(rows)) => Ok(rows.clone()),
        Some(Value::Null) | None if is_success(resp) == Some(true) => Ok(Vec::new()),
        _ => Err(LedgerError::MalformedResponse {
            action: action.to_string(),
            detail: "no rows array in response".to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// POSTs `{action, token, ...params}` to the webhook.
pub struct WebhookClient {
    url: String,
    token: Option<Zeroizing<String>>,
    timeout: Duration,
    client: Client,
}

impl WebhookClient {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url = normalize_webhook_url(url);
        if url.is_empty() {
            return Err(LedgerError::Config("webhook URL is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            url,
            token: token.map(Zeroizing::new),
            timeout,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn body(&self, action: &str, params: Value) -> Value {
        let mut body = Map::new();
        body.insert("action".to_string(), Value::String(action.to_string()));
        if let Some(token) = &self.token {
            body.insert("token".to_string(), Value::String(token.as_str().to_string()));
        }
        if let Value::Object(params) = params {
            for (k, v) in params {
                if k != "action" && k != "token" {
                    body.insert(k, v);
                }
            }
        }
        Value::Object(body)
    }
}

#[async_trait]
impl LedgerRpc for WebhookClient {
    async fn call(&self, action: &str, params: Value) -> Result<Value> {
        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&self.body(action, params))
            .send()
            .await
            .map_err(|e| friendly_error(&self.url, &e, self.timeout))?;

        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.url, &e, self.timeout))?;
        let latency_ms = start.elapsed().as_millis() as u64;

        if !status.is_success() {
            warn!(action = %action, status = status.as_u16(), latency_ms, "webhook call failed");
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("error")
                        .or_else(|| json.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| status_error(status));
            return Err(LedgerError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        debug!(action = %action, latency_ms, bytes = body_text.len(), "webhook call ok");
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| LedgerError::MalformedResponse {
            action: action.to_string(),
            detail: format!("invalid JSON: {e}"),
        })
    }
}


/// Scripted [`LedgerRpc`] for engine tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    type Scripted = (Duration, Result<Value>);

    #[derive(Default)]
    pub(crate) struct FakeRpc {
        replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeRpc {
        pub(crate) fn reply(&self, action: &str, resp: Value) -> &Self {
            self.script(action, Duration::ZERO, Ok(resp))
        }

        pub(crate) fn fail(&self, action: &str, err: LedgerError) -> &Self {
            self.script(action, Duration::ZERO, Err(err))
        }

        pub(crate) fn script(&self, action: &str, delay: Duration, result: Result<Value>) -> &Self {
            self.replies
                .lock()
                .unwrap()
                .entry(action.to_string())
                .or_default()
                .push_back((delay, result));
            self
        }

        pub(crate) fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LedgerRpc for FakeRpc {
        async fn call(&self, action: &str, params: Value) -> Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((action.to_string(), params));
            let next = self
                .replies
                .lock()
                .unwrap()
                .get_mut(action)
                .and_then(VecDeque::pop_front);
            let Some((delay, result)) = next else {
                return Err(LedgerError::Network {
                    url: "fake://ledger".to_string(),
                    message: format!("no scripted reply for {action}"),
                });
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
    }
}
