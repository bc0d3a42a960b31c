//! Manual mock implementations for the core traits, in the style the
//! teacher uses in `providers/fallback/tests.rs`: plain structs holding a
//! pre-scripted outcome rather than a mocking-framework macro.

use crate::context::{Chunk, StreamSink};
use crate::error::ProviderError;
use crate::message::{Message, Usage};
use crate::provider::{ChatRequest, ChatResponse, Provider};
use crate::state_store::StateStore;
use crate::tools::{ToolExecutionResult, ToolInvoker};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

/// Replays a fixed script of assistant messages, one per call; returns a
/// validation error once exhausted so runaway loops fail loudly in tests.
pub struct ScriptedProvider {
    script: Mutex<Vec<Message>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Message>) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn predict(&self, _req: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(ProviderError::Validation("mock script exhausted".into()));
        }
        Ok(ChatResponse {
            message: script.remove(0),
            usage: Usage::default(),
        })
    }

    async fn predict_stream(
        &self,
        req: ChatRequest,
        _sink: StreamSink,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        self.predict(req).await
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Always fails with the given `ProviderError`.
pub struct FailingProvider(pub ProviderError);

#[async_trait]
impl Provider for FailingProvider {
    async fn predict(&self, _req: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
        Err(self.0.clone())
    }

    async fn predict_stream(
        &self,
        _req: ChatRequest,
        _sink: StreamSink,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        Err(self.0.clone())
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Replays a scripted sequence of text deltas followed by either a final
/// message or a terminal provider error — for exercising the streaming loop
/// (§4.4.3) and its error path (§8 scenario 5) without a live backend.
pub struct StreamingScriptedProvider {
    deltas: Vec<String>,
    outcome: Mutex<Option<std::result::Result<Message, ProviderError>>>,
}

impl StreamingScriptedProvider {
    pub fn new(deltas: Vec<String>, outcome: std::result::Result<Message, ProviderError>) -> Self {
        Self {
            deltas,
            outcome: Mutex::new(Some(outcome)),
        }
    }
}

#[async_trait]
impl Provider for StreamingScriptedProvider {
    async fn predict(&self, _req: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
        Err(ProviderError::Validation(
            "StreamingScriptedProvider only supports predict_stream".into(),
        ))
    }

    async fn predict_stream(
        &self,
        _req: ChatRequest,
        sink: StreamSink,
    ) -> std::result::Result<ChatResponse, ProviderError> {
        for delta in &self.deltas {
            sink.send(Chunk::TextDelta(delta.clone())).await.ok();
        }
        let outcome = self
            .outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(ProviderError::Validation("script exhausted".into())));
        outcome.map(|message| ChatResponse {
            message,
            usage: Usage::default(),
        })
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Returns its input arguments as the tool result content, unmodified.
pub struct EchoTool;

#[async_trait]
impl ToolInvoker for EchoTool {
    async fn execute(&self, args: Value) -> ToolExecutionResult {
        ToolExecutionResult::Complete {
            content: args.to_string(),
        }
    }
}

/// A `StateStore` that always reports empty history — useful when a test
/// needs the middleware wired in but doesn't care about persistence.
#[derive(Default)]
pub struct NullStateStore;

#[async_trait]
impl StateStore for NullStateStore {
    async fn load(&self, _session_id: &str) -> crate::error::Result<Option<Value>> {
        Ok(None)
    }

    async fn save(&self, _session_id: &str, _state: Value) -> crate::error::Result<()> {
        Ok(())
    }

    async fn delete(&self, _session_id: &str) -> crate::error::Result<()> {
        Ok(())
    }
}
