use crate::error::{PipelineError, Result};
use crate::message::{Message, Usage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// A unit in a streaming response (§3, GLOSSARY).
#[derive(Debug, Clone)]
pub enum Chunk {
    TextDelta(String),
    ToolCallDelta {
        id: String,
        name_delta: Option<String>,
        args_delta: String,
    },
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    RoundCapReached,
}

impl Chunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::Finish { .. } | Chunk::Error(_))
    }
}

/// Owned by the supervisor, written by the provider middleware. Enforces
/// "closed exactly once" and "exactly one terminal chunk" (§3 invariants,
/// §8 testable properties) by rejecting a second terminal send.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<Chunk>,
    terminal_sent: Arc<AtomicBool>,
}

impl StreamSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Chunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                terminal_sent: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Forward a non-terminal chunk. Silently drops the chunk if the
    /// consumer has already gone away (slow/cancelled reader) — delivery
    /// beyond that point is best-effort per §5 "already-emitted chunks are
    /// not retracted".
    pub async fn send(&self, chunk: Chunk) -> Result<()> {
        if chunk.is_terminal() {
            return self.send_terminal(chunk).await;
        }
        if self.terminal_sent.load(Ordering::Acquire) {
            return Err(PipelineError::Invariant(
                "stream sink: chunk sent after terminal chunk".into(),
            ));
        }
        let _ = self.tx.send(chunk).await;
        Ok(())
    }

    /// Send the single allowed terminal chunk (`Finish` or `Error`).
    pub async fn send_terminal(&self, chunk: Chunk) -> Result<()> {
        if self
            .terminal_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PipelineError::Invariant(
                "stream sink: terminal chunk sent more than once".into(),
            ));
        }
        let _ = self.tx.send(chunk).await;
        Ok(())
    }

    pub fn has_closed(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }
}

/// The request's cancellable lifetime anchor (§3). Modeled after a
/// Go-style `context.Context`: `done()` resolves on deadline expiry or
/// explicit cancellation, whichever comes first.
#[derive(Clone)]
pub struct Deadline {
    at: Instant,
    cancel_rx: watch::Receiver<bool>,
}

impl Deadline {
    pub(crate) fn new(at: Instant, cancel_rx: watch::Receiver<bool>) -> Self {
        Self { at, cancel_rx }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at || self.is_cancelled()
    }

    /// Resolves once the deadline passes or the request is cancelled.
    pub async fn done(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.cancel_rx.clone();
        tokio::select! {
            () = tokio::time::sleep_until(self.at) => {}
            _ = rx.changed() => {}
        }
    }
}

/// Typed accessors over the otherwise-opaque metadata bag (§9 "Dynamic
/// metadata bag" design note): the core reads `trace_id` and `scenario_hint`
/// directly; everything else stays an opaque pass-through map.
#[derive(Debug, Clone, Default)]
pub struct Metadata(HashMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.0.get("trace_id").and_then(Value::as_str)
    }

    pub fn set_trace_id(&mut self, id: impl Into<String>) {
        self.insert("trace_id", Value::String(id.into()));
    }

    pub fn scenario_hint(&self) -> Option<&str> {
        self.0.get("scenario_hint").and_then(Value::as_str)
    }
}

/// Per-request mutable carrier shared across middlewares (C1, §4.1).
///
/// Not internally synchronized: correctness relies on the chain's
/// single-owner-at-a-time discipline (§4.1). The one concurrency boundary
/// within a request is the stream sink, which is `Clone` and safe to hand
/// to the supervisor for concurrent reads while the provider middleware
/// writes to it.
pub struct ExecutionContext {
    deadline: Deadline,
    messages: Vec<Message>,
    response: Option<Message>,
    streaming: bool,
    stream_sink: Option<StreamSink>,
    allowed_tools: HashSet<String>,
    max_tool_calls_per_turn: Option<usize>,
    param_overrides: SamplingParams,
    metadata: Metadata,
    round: u32,
    usage: Usage,
    error: Option<String>,
}

/// Per-request sampling-parameter overrides staged by `PromptAssembly` from
/// the selected prompt's declared defaults (§3 "parameters (temperature,
/// max_tokens, top_p, stop, seed)", §4.5 "applies parameter defaults").
/// Fields left `None`/empty fall through to the provider middleware's own
/// construction-time defaults.
#[derive(Debug, Clone, Default)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub seed: Option<u64>,
}

impl ExecutionContext {
    pub fn new(messages: Vec<Message>, deadline: Deadline) -> Self {
        Self {
            deadline,
            messages,
            response: None,
            streaming: false,
            stream_sink: None,
            allowed_tools: HashSet::new(),
            max_tool_calls_per_turn: None,
            param_overrides: SamplingParams::default(),
            metadata: Metadata::new(),
            round: 0,
            usage: Usage::default(),
            error: None,
        }
    }

    pub fn with_streaming(mut self, sink: StreamSink) -> Self {
        self.streaming = true;
        self.stream_sink = Some(sink);
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    pub fn set_response(&mut self, message: Message) {
        self.response = Some(message);
    }

    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Message> {
        self.response.take()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn stream_sink(&self) -> Option<&StreamSink> {
        self.stream_sink.as_ref()
    }

    pub fn allowed_tools(&self) -> &HashSet<String> {
        &self.allowed_tools
    }

    pub fn set_allowed_tools(&mut self, tools: HashSet<String>) {
        self.allowed_tools = tools;
    }

    /// Per-turn cap on tool calls a single round may dispatch (pack's
    /// declared tool policy, §4.4.2 step 4). `None` means unlimited.
    pub fn max_tool_calls_per_turn(&self) -> Option<usize> {
        self.max_tool_calls_per_turn
    }

    pub fn set_max_tool_calls_per_turn(&mut self, cap: Option<usize>) {
        self.max_tool_calls_per_turn = cap;
    }

    pub fn param_overrides(&self) -> &SamplingParams {
        &self.param_overrides
    }

    pub fn set_param_overrides(&mut self, params: SamplingParams) {
        self.param_overrides = params;
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub async fn done(&self) {
        self.deadline.done().await;
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn advance_round(&mut self) {
        self.round += 1;
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn accumulate_usage(&mut self, usage: Usage) {
        self.usage.accumulate(usage);
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
