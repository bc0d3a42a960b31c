use crate::error::{PipelineError, ProviderError, Result};
use crate::message::{Message, ToolCallRequest, Usage};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// A tool's schema as declared to a provider (C4/§3). Distinct from
/// `ToolDescriptor` (§4.3): the provider only ever sees name/description/
/// schema, never the mock/live dispatch details.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A single non-streaming completion request (§4.4.1/§4.4.2).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

/// Result of one non-streaming completion: either a final answer, or one or
/// more tool calls the caller must resolve before the conversation can
/// continue (§4.4.2).
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Usage,
}

/// Backoff schedule for retrying transient provider failures (§4.4.5):
/// exponential with multiplier, capped, plus up to 25% jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// A completion backend (C4's collaborator, §4.4). Implementations decide
/// how their own wire-level failures classify into `ProviderError`; the
/// core never inspects provider-specific error types directly.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn predict(&self, req: ChatRequest) -> std::result::Result<ChatResponse, ProviderError>;

    /// Emit the response as a sequence of non-terminal deltas on `sink`
    /// (`TextDelta`/`ToolCallDelta`), returning the fully assembled message
    /// once the provider's stream ends. The middleware — not the provider —
    /// owns sending the single terminal `Finish`/`Error` chunk (§3, §8:
    /// "exactly one terminal chunk"), so implementations must not send one.
    /// Implementations that can't stream natively may synthesize a single
    /// `TextDelta` from a call to `predict` and return its result directly.
    async fn predict_stream(
        &self,
        req: ChatRequest,
        sink: crate::context::StreamSink,
    ) -> std::result::Result<ChatResponse, ProviderError>;

    fn supports_streaming(&self) -> bool;

    /// Dollar cost estimate for a completed exchange, given token usage.
    /// Default implementation reports zero cost for providers that don't
    /// track pricing.
    fn calculate_cost(&self, _usage: Usage) -> f64 {
        0.0
    }

    /// Release any held resources (connection pools, background tasks).
    /// Default is a no-op.
    async fn close(&self) -> std::result::Result<(), ProviderError> {
        Ok(())
    }

    /// Call `predict` with retry on transient failures: exponential backoff
    /// with jitter, capped at `RetryConfig::max_delay_ms` (§4.4.5). Non-
    /// transient errors (`Validation`, `Auth`, `Cancelled`) return
    /// immediately without consuming a retry.
    async fn predict_with_retry(
        &self,
        req: ChatRequest,
        retry_config: &RetryConfig,
    ) -> Result<ChatResponse> {
        let mut last_error = None;
        for attempt in 0..=retry_config.max_retries {
            if attempt > 0 {
                warn!(
                    attempt,
                    max_retries = retry_config.max_retries,
                    "retrying provider call after transient error"
                );
            }
            match self.predict(req.clone()).await {
                Ok(response) => {
                    debug!(attempt, "provider call succeeded");
                    return Ok(response);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(PipelineError::Provider(err));
                    }
                    let is_last = attempt == retry_config.max_retries;
                    last_error = Some(err);
                    if !is_last {
                        let base = (retry_config.initial_delay_ms as f64
                            * retry_config.backoff_multiplier.powi(attempt as i32))
                        .min(retry_config.max_delay_ms as f64);
                        let jitter = base * 0.25 * fastrand::f64();
                        let delay_ms = (base + jitter) as u64;
                        debug!(delay_ms, "backing off before retry");
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }
        Err(PipelineError::Provider(
            last_error.unwrap_or(ProviderError::Transient("retries exhausted".into())),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallBatch(pub Vec<ToolCallRequest>);
