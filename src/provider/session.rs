//! Rate-governed provider session.
//!
//! Every extractor call funnels through here: take a token from the
//! governor, issue the request under the plugin's timeout, and on a
//! throttle response apply the refill penalty before spending the bounded
//! retry budget. An in-flight request is never aborted by cancellation so
//! the token accounting stays honest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::ExtractError;
use crate::provider::{ProviderClient, ProviderPayload};
use crate::scheduler::rate::RateGovernor;

pub struct ProviderSession {
    provider: Arc<dyn ProviderClient>,
    governor: Arc<RateGovernor>,
    plugin: String,
    call_timeout: Duration,
    rate_limited_retry_budget: u32,
}

impl ProviderSession {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        governor: Arc<RateGovernor>,
        plugin: &str,
        call_timeout: Duration,
        rate_limited_retry_budget: u32,
    ) -> Self {
        Self {
            provider,
            governor,
            plugin: plugin.to_string(),
            call_timeout,
            rate_limited_retry_budget,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub async fn call(
        &self,
        api_name: &str,
        params: &Value,
        fields: &[&str],
    ) -> Result<ProviderPayload, ExtractError> {
        let mut rate_limited_attempts = 0u32;
        loop {
            self.governor.acquire(&self.plugin).await;

            let fut = self.provider.call(api_name, params, fields);
            let outcome = match tokio::time::timeout(self.call_timeout, fut).await {
                Ok(r) => r,
                Err(_) => return Err(ExtractError::Timeout(self.call_timeout)),
            };

            match outcome {
                Err(ExtractError::RateLimited { retry_after_secs }) => {
                    rate_limited_attempts += 1;
                    self.governor
                        .acquire_penalty(&self.plugin, retry_after_secs)
                        .await;
                    if rate_limited_attempts > self.rate_limited_retry_budget {
                        return Err(ExtractError::RateLimited { retry_after_secs });
                    }
                    warn!(
                        plugin = %self.plugin,
                        attempt = rate_limited_attempts,
                        penalty_secs = retry_after_secs,
                        "provider throttled, retrying after penalty"
                    );
                }
                other => return other,
            }
        }
    }
}
