//! Upstream market-data provider client.
//!
//! The provider speaks a single-endpoint JSON protocol: every dataset is an
//! `api_name` invoked with a parameter object and a field list, answering
//! with a column-name array plus row tuples. Extractors stay provider-shape
//! agnostic behind the [`ProviderClient`] trait so tests can inject a
//! deterministic double.

pub mod session;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ExtractError;

/// Provider code used for per-minute throttle rejections.
const THROTTLE_CODE: i64 = 40203;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// One page of provider output.
#[derive(Debug, Clone, Default)]
pub struct ProviderPayload {
    pub fields: Vec<String>,
    pub items: Vec<Vec<Value>>,
    pub has_more: bool,
}

impl ProviderPayload {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Zip field names over the row tuples into JSON objects.
    pub fn rows(&self) -> Vec<serde_json::Map<String, Value>> {
        self.items
            .iter()
            .map(|item| {
                self.fields
                    .iter()
                    .cloned()
                    .zip(item.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Issue one provider request. Implementations must surface throttling
    /// as [`ExtractError::RateLimited`] so the caller can apply a governor
    /// penalty instead of burning its retry budget blind.
    async fn call(
        &self,
        api_name: &str,
        params: &Value,
        fields: &[&str],
    ) -> Result<ProviderPayload, ExtractError>;
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    api_name: &'a str,
    token: &'a str,
    params: &'a Value,
    fields: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<WireData>,
}

#[derive(Debug, Deserialize)]
struct WireData {
    fields: Vec<String>,
    items: Vec<Vec<Value>>,
    #[serde(default)]
    has_more: bool,
}

/// HTTP implementation against the real upstream.
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    token: String,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(base_url: String, token: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("stockdata-backend/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url,
            token,
            timeout,
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    async fn call(
        &self,
        api_name: &str,
        params: &Value,
        fields: &[&str],
    ) -> Result<ProviderPayload, ExtractError> {
        let req = WireRequest {
            api_name,
            token: &self.token,
            params,
            fields: fields.join(","),
        };

        let resp = self
            .http
            .post(&self.base_url)
            .timeout(self.timeout)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractError::Timeout(self.timeout)
                } else {
                    ExtractError::Transport(e.to_string())
                }
            })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ExtractError::RateLimited { retry_after_secs });
        }
        if !resp.status().is_success() {
            return Err(ExtractError::Transport(format!(
                "http {} from provider",
                resp.status().as_u16()
            )));
        }

        let body: WireResponse = resp
            .json()
            .await
            .map_err(|e| ExtractError::Transport(format!("malformed provider body: {e}")))?;

        if body.code != 0 {
            let message = body.msg.unwrap_or_default();
            if body.code == THROTTLE_CODE || message.contains("每分钟") {
                return Err(ExtractError::RateLimited {
                    retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
                });
            }
            return Err(ExtractError::Provider {
                code: body.code,
                message,
            });
        }

        let data = body.data.unwrap_or(WireData {
            fields: Vec::new(),
            items: Vec::new(),
            has_more: false,
        });
        debug!(api = api_name, rows = data.items.len(), "provider page");

        Ok(ProviderPayload {
            fields: data.fields,
            items: data.items,
            has_more: data.has_more,
        })
    }
}
