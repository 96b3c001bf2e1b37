//! Provider gateway for OpenAI-compatible chat completions.

pub mod error;
pub mod openai_compat;
pub mod registry;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use openai_compat::ChatProvider;
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use openai_compat::OpenAiCompatAdapter;
pub use registry::ProviderRegistry;
pub use types::*;
pub use usage::{CsvRequestLog, NoopUsageSink, StderrUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// HTTP timeout for adapters built by [`ProviderRegistry::from_env`].
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: openai_compat::DEFAULT_TIMEOUT,
        }
    }
}

/// Wraps a provider with retries and usage recording.
pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: Arc<dyn ChatProvider>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn new(provider: Arc<dyn ChatProvider>, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            let result = self.provider.chat(&req).await;
            match result {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), CallStatus::Success, None, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    let request_id = err.request_id().map(str::to_string);
                    self.record_usage(&req, None, CallStatus::Error, Some(code), request_id)
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = retry_delay(self.config.retry_base_delay, attempt, &err);
                    debug!(
                        provider = self.provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider(self.provider.name(), "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: Option<&ChatResponse>,
        status: CallStatus,
        error_code: Option<String>,
        error_request_id: Option<String>,
    ) {
        let attribution = &req.attribution;
        let mut record = ProviderCallRecord::new(
            self.provider.name(),
            "chat/completions",
            req.model.name.clone(),
            attribution.caller,
        )
        .completion(attribution.completion_id)
        .survey(attribution.survey.clone())
        .turn(attribution.turn);
        if let Some(last) = req.messages.last() {
            record = record.prompt(last.content.clone());
        }

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens, resp.output_tokens)
                .latency(resp.latency.as_millis() as u64)
                .model_version(resp.model_version.clone())
                .request_id(resp.request_id.clone())
                .response(resp.content.clone());
        } else {
            record = record.request_id(error_request_id);
        }

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

/// Backoff for `attempt`, stretched to the provider's hint when it gave a longer one.
fn retry_delay(base: Duration, attempt: u32, err: &ProviderError) -> Duration {
    let backoff = backoff_delay(base, attempt);
    err.retry_after().map_or(backoff, |hint| hint.max(backoff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }

    #[test]
    fn rate_limit_hint_stretches_the_backoff() {
        let base = Duration::from_millis(100);
        let limited = ProviderError::rate_limited(
            "openai",
            Duration::from_secs(60),
            ErrorContext::default(),
        );
        assert_eq!(retry_delay(base, 0, &limited), Duration::from_secs(60));

        let short = ProviderError::rate_limited(
            "openai",
            Duration::from_millis(50),
            ErrorContext::default(),
        );
        assert_eq!(retry_delay(base, 2, &short), Duration::from_millis(400));

        let transient = ProviderError::provider("openai", "overloaded", true);
        assert_eq!(retry_delay(base, 1, &transient), Duration::from_millis(200));
    }
}
