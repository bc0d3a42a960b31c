use std::time::Duration;

/// All tunables exposed by the external interface (§6), collected into one
/// plain struct the way the teacher collects its `AgentLoopConfig`/
/// `SubagentConfig`. No environment-variable loading here — that belongs to
/// whatever embeds this crate as a binary.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Weighted semaphore capacity bounding concurrent in-flight executions.
    pub max_concurrent_executions: usize,
    /// Per-execution wall-clock budget, combined with the caller's own
    /// deadline by taking the minimum of the two (§5).
    pub execution_timeout: Duration,
    /// How long `shutdown()` waits for in-flight executions to finish
    /// before abandoning them (§5 "graceful shutdown").
    pub graceful_shutdown_timeout: Duration,
    /// Bounded channel capacity for each execution's stream sink.
    pub stream_buffer_size: usize,
    /// Round cap enforced by the provider middleware (§4.4.2, §8).
    pub max_rounds: u32,
    /// Whether the validator middleware runs on every streamed chunk
    /// (cumulative-buffer mode) or only once at the end (§4.5, §9 open
    /// question "StreamAfterToolRounds").
    pub stream_after_tool_rounds: bool,
    /// Whether the state-store middleware validates the response before
    /// persisting it, or persists first and validates after (§9 open
    /// question — defaults to save-before-validate).
    pub validate_before_save: bool,
    /// Provider transient-error retry cap (§4.4.5, §6 `MaxRetries`).
    pub max_retries: usize,
    /// Backoff floor for provider retries (§6 `RetryBaseDelay`).
    pub retry_base_delay: Duration,
    /// Backoff ceiling for provider retries (§6 `RetryMaxDelay`).
    pub retry_max_delay: Duration,
    /// Whether `TemplateRender` fails the request on an unresolved
    /// `{{variable}}` or leaves it literal (§4.5, §6 `StrictTemplates`).
    pub strict_templates: bool,
    /// Trims loaded history to at most this many prior messages before
    /// prepending them to the request (§4.5, §6 `MaxHistoryMessages`).
    /// `None` means unlimited, the documented default.
    pub max_history_messages: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 100,
            execution_timeout: Duration::from_secs(30),
            graceful_shutdown_timeout: Duration::from_secs(10),
            stream_buffer_size: 100,
            max_rounds: 10,
            stream_after_tool_rounds: false,
            validate_before_save: false,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            strict_templates: true,
            max_history_messages: None,
        }
    }
}
