use crate::context::ExecutionContext;
use crate::error::Result;
use crate::message::Message;
use crate::middleware::{Middleware, Next};
use crate::state_store::StateStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

fn session_id(ctx: &ExecutionContext) -> String {
    ctx.metadata()
        .get("session_id")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_string()
}

/// Loads prior conversational state and prepends it to the request before
/// the rest of the chain runs (§4.5). Positioned ahead of `PromptAssembly`
/// and `TemplateRender` in the standard chain so loaded history lands after
/// the prompt's system message rather than splicing in ahead of it.
///
/// Load failures are fatal to the request (propagated via `?`).
pub struct StateStoreLoad {
    store: Arc<dyn StateStore>,
    max_history: Option<usize>,
}

impl StateStoreLoad {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            max_history: None,
        }
    }

    /// Trim loaded history to at most `max` prior messages before
    /// prepending it to the request (§4.5, §6 `MaxHistoryMessages`).
    pub fn with_max_history(mut self, max: Option<usize>) -> Self {
        self.max_history = max;
        self
    }
}

#[async_trait]
impl Middleware for StateStoreLoad {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let session_id = session_id(ctx);
        if let Some(state) = self.store.load(&session_id).await? {
            let mut history: Vec<Message> = state
                .get("messages")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if let Some(max) = self.max_history {
                let len = history.len();
                if len > max {
                    history.drain(0..len - max);
                }
            }
            for (offset, message) in history.into_iter().enumerate() {
                ctx.messages_mut().insert(offset, message);
            }
        }

        next.call(ctx).await
    }

    fn name(&self) -> &'static str {
        "state_store_load"
    }
}

/// Persists the conversation after the chain runs (§4.5). Positioned
/// relative to `Validator` according to `validate_before_save` (§9 open
/// question) — by default it runs before validation, so a
/// rejected-by-validator response is still saved for audit.
///
/// Save failures only degrade to a logged warning so a validator-approved
/// response is never turned into an error just because persistence failed
/// (§4.5, §7 "save failures degrade to warnings").
pub struct StateStoreSave {
    store: Arc<dyn StateStore>,
}

impl StateStoreSave {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for StateStoreSave {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let result = next.call(ctx).await;

        let session_id = session_id(ctx);
        let messages = json!(ctx.messages());
        let response = ctx.response().map(|m| json!(m));
        if let Err(err) = self
            .store
            .save(
                &session_id,
                json!({ "messages": messages, "response": response }),
            )
            .await
        {
            warn!(error = %err, session_id, "state store save failed, response already produced");
        }

        result
    }

    fn name(&self) -> &'static str {
        "state_store_save"
    }
}
