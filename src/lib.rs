//! Concurrent, middleware-composed runtime for LLM-backed conversational
//! pipelines.
//!
//! A [`Pipeline`](pipeline::Pipeline) admits requests under a bounded
//! concurrency limit, builds a fresh [`ExecutionContext`](context::ExecutionContext)
//! per request, and drives it through a [`Chain`](middleware::Chain) of
//! [`Middleware`](middleware::Middleware) — ending in a
//! [`ProviderMiddleware`](provider_middleware::ProviderMiddleware) that runs
//! the request/tool-call loop against a [`Provider`](provider::Provider).

pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod middleware;
pub mod middlewares;
pub mod pack;
pub mod pipeline;
pub mod provider;
pub mod provider_middleware;
pub mod state_store;
pub mod tools;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::PipelineConfig;
pub use context::{Chunk, Deadline, ExecutionContext, FinishReason, Metadata, SamplingParams, StreamSink};
pub use error::{AdmissionError, PipelineError, ProviderError, Result};
pub use message::{ContentPart, Message, Role, ToolCallRequest, ToolResultPayload, Usage};
pub use middleware::{Chain, Middleware, Next};
pub use pack::{Pack, PromptDefinition, StaticPack, ToolPolicy};
pub use pipeline::{Pipeline, PipelineBuilder, SupervisorState};
pub use provider::{ChatRequest, ChatResponse, Provider, RetryConfig, ToolDefinition};
pub use provider_middleware::ProviderMiddleware;
pub use state_store::{InMemoryStateStore, StateStore};
pub use tools::{
    PendingInfo, ToolDescriptor, ToolExecutionResult, ToolInvoker, ToolMode, ToolRegistry,
};
