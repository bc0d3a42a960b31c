use crate::context::{Chunk, ExecutionContext, FinishReason};
use crate::error::{PipelineError, Result};
use crate::message::{Message, ToolCallRequest};
use crate::middleware::{Middleware, Next};
use crate::provider::{ChatRequest, Provider, RetryConfig, ToolDefinition};
use crate::tools::{ToolExecutionResult, ToolRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upper bound on provider round-trips within a single execution before the
/// loop gives up and synthesizes a final assistant turn (§4.4.2, §8
/// boundary behaviors).
const DEFAULT_MAX_ROUNDS: u32 = 10;

/// C4: drives the request/tool-call loop against a `Provider`.
///
/// Reimplements the tool-calling loop as an explicit state machine —
/// Init -> CallProvider -> (HaveResponse | HaveToolCalls) -> (ExecuteTools
/// -> CallProvider)* -> Finalize — rather than one long function walking a
/// mutable history buffer (§9 design note). Each state transition is a
/// private method; `process` just drives the machine to completion.
pub struct ProviderMiddleware {
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    retry_config: RetryConfig,
    max_rounds: u32,
    model: Option<String>,
    max_tokens: u32,
    temperature: f32,
    top_p: Option<f32>,
    stop: Vec<String>,
    seed: Option<u64>,
}

enum State {
    CallProvider,
    HaveToolCalls(Vec<ToolCallRequest>),
    Finalize,
}

impl ProviderMiddleware {
    pub fn new(provider: Arc<dyn Provider>, tools: ToolRegistry) -> Self {
        Self {
            provider,
            tools,
            retry_config: RetryConfig::default(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
            top_p: None,
            stop: Vec::new(),
            seed: None,
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_sampling(mut self, top_p: Option<f32>, stop: Vec<String>, seed: Option<u64>) -> Self {
        self.top_p = top_p;
        self.stop = stop;
        self.seed = seed;
        self
    }

    fn tool_definitions(&self, ctx: &ExecutionContext) -> Vec<ToolDefinition> {
        self.tools
            .schemas_for(ctx.allowed_tools())
            .into_iter()
            .filter_map(|schema| {
                let function = schema.get("function")?;
                Some(ToolDefinition {
                    name: function.get("name")?.as_str()?.to_string(),
                    description: function
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    parameters: function.get("parameters").cloned().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Builds the outgoing request, letting a prompt's declared sampling
    /// defaults (staged onto the context by `PromptAssembly`, §4.5 "applies
    /// parameter defaults") override this middleware's own construction-time
    /// defaults field by field.
    fn build_request(&self, ctx: &ExecutionContext) -> ChatRequest {
        let overrides = ctx.param_overrides();
        ChatRequest {
            messages: ctx.messages().to_vec(),
            tools: self.tool_definitions(ctx),
            model: self.model.clone(),
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            temperature: overrides.temperature.unwrap_or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            stop: overrides.stop.clone().unwrap_or_else(|| self.stop.clone()),
            seed: overrides.seed.or(self.seed),
        }
    }

    /// One non-streaming round-trip to the provider, with retry (§4.4.5).
    async fn call_provider(&self, ctx: &mut ExecutionContext) -> Result<State> {
        if ctx.round() >= self.max_rounds {
            warn!(max_rounds = self.max_rounds, "round cap reached");
            return Ok(State::Finalize);
        }
        ctx.advance_round();
        let req = self.build_request(ctx);
        let response = self.provider.predict_with_retry(req, &self.retry_config).await?;
        ctx.accumulate_usage(response.usage);
        if response.message.has_tool_calls() {
            let calls = response
                .message
                .tool_calls
                .clone()
                .unwrap_or_default();
            ctx.messages_mut().push(response.message);
            Ok(State::HaveToolCalls(calls))
        } else {
            ctx.set_response(response.message.clone());
            ctx.messages_mut().push(response.message);
            Ok(State::Finalize)
        }
    }

    /// Execute every requested tool call, after enforcing the pack's tool
    /// policy (§4.4.2 step 4, GLOSSARY "Tool policy"): calls naming a tool
    /// outside `ctx.allowed_tools()`, calls beyond the per-turn cap, and a
    /// second call reusing an id already seen this round (§4.4.2 tie-breaks)
    /// all become synthetic `Failed` results without ever reaching the
    /// registry. Everything that survives runs inline for a single call, or
    /// concurrently via `spawn` + `join_all` for two or more, with results
    /// reassembled in the assistant's declared order regardless of
    /// completion order (§8 "declared order preserved").
    async fn execute_tools(
        &self,
        ctx: &ExecutionContext,
        calls: &[ToolCallRequest],
    ) -> Vec<ToolExecutionResult> {
        let allowed = ctx.allowed_tools();
        let cap = ctx.max_tool_calls_per_turn();
        let mut seen_ids = std::collections::HashSet::new();
        let mut results: Vec<Option<ToolExecutionResult>> = vec![None; calls.len()];
        let mut to_execute = Vec::new();
        let mut executed_count = 0usize;

        for (i, tc) in calls.iter().enumerate() {
            if !seen_ids.insert(tc.id.clone()) {
                warn!(id = %tc.id, "duplicate tool_call id in round, dropping");
                results[i] = Some(ToolExecutionResult::Failed {
                    error: format!("duplicate tool_call id in round: {}", tc.id),
                });
                continue;
            }
            if !allowed.is_empty() && !allowed.contains(&tc.name) {
                results[i] = Some(ToolExecutionResult::Failed {
                    error: format!("tool '{}' not permitted by policy", tc.name),
                });
                continue;
            }
            if cap.is_some_and(|cap| executed_count >= cap) {
                results[i] = Some(ToolExecutionResult::Failed {
                    error: "per-turn tool call cap exceeded".to_string(),
                });
                continue;
            }
            executed_count += 1;
            to_execute.push(i);
        }

        if let [i] = to_execute[..] {
            let tc = &calls[i];
            results[i] = Some(self.tools.execute(&tc.name, tc.args.clone()).await);
        } else if !to_execute.is_empty() {
            let handles: Vec<_> = to_execute
                .iter()
                .map(|&i| {
                    let registry = self.tools.clone();
                    let name = calls[i].name.clone();
                    let args = calls[i].args.clone();
                    tokio::task::spawn(async move { registry.execute(&name, args).await })
                })
                .collect();
            let joined = futures_util::future::join_all(handles).await;
            for (&i, outcome) in to_execute.iter().zip(joined.into_iter()) {
                results[i] = Some(match outcome {
                    Ok(result) => result,
                    Err(join_err) => {
                        error!(error = %join_err, "tool task panicked");
                        ToolExecutionResult::Failed {
                            error: "tool task panicked".to_string(),
                        }
                    }
                });
            }
        }

        results.into_iter().map(|r| r.expect("every index filled")).collect()
    }

    fn append_tool_results(
        &self,
        ctx: &mut ExecutionContext,
        calls: &[ToolCallRequest],
        results: Vec<ToolExecutionResult>,
    ) -> Option<State> {
        if results.iter().any(ToolExecutionResult::is_pending) {
            // Human-in-the-loop: stop the loop here. The supervisor returns
            // control to the caller, who resumes later via `add_tool_result`
            // + `continue_execution` (§4.4.4).
            for (tc, result) in calls.iter().zip(results.iter()) {
                ctx.messages_mut()
                    .push(Message::tool_result(tc.id.clone(), result.as_message_content()));
            }
            ctx.set_error("pending human-in-the-loop tool result");
            return Some(State::Finalize);
        }
        for (tc, result) in calls.iter().zip(results.iter()) {
            ctx.messages_mut()
                .push(Message::tool_result(tc.id.clone(), result.as_message_content()));
        }
        None
    }

    /// Resume a suspended execution once a human has supplied the missing
    /// tool result (§4.4.4 `AddToolResult`/`Continue`).
    pub fn add_tool_result(&self, ctx: &mut ExecutionContext, tool_call_id: &str, content: &str) {
        ctx.messages_mut()
            .push(Message::tool_result(tool_call_id, content));
    }

    async fn finalize(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if ctx.response().is_none() {
            if ctx.round() >= self.max_rounds {
                ctx.set_response(Message::assistant(
                    Some("round limit reached before a final answer was produced".into()),
                    vec![],
                ));
            }
        }
        if let Some(sink) = ctx.stream_sink().cloned() {
            let reason = if ctx.round() >= self.max_rounds {
                FinishReason::RoundCapReached
            } else {
                FinishReason::Stop
            };
            sink.send_terminal(Chunk::Finish {
                reason,
                usage: Some(ctx.usage()),
            })
            .await?;
        }
        Ok(())
    }

    async fn run_non_streaming(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let deadline = ctx.deadline().clone();
        let mut state = State::CallProvider;
        loop {
            tokio::select! {
                biased;
                () = deadline.done() => {
                    return Err(PipelineError::Timeout);
                }
                stepped = self.step(ctx, state) => {
                    match stepped? {
                        Some(next) => state = next,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn step(&self, ctx: &mut ExecutionContext, state: State) -> Result<Option<State>> {
        match state {
            State::CallProvider => Ok(Some(self.call_provider(ctx).await?)),
            State::HaveToolCalls(calls) => {
                info!(count = calls.len(), "executing tool calls");
                let results = self.execute_tools(ctx, &calls).await;
                match self.append_tool_results(ctx, &calls, results) {
                    Some(state) => Ok(Some(state)),
                    None => Ok(Some(State::CallProvider)),
                }
            }
            State::Finalize => {
                self.finalize(ctx).await?;
                debug!(round = ctx.round(), "execution finalized");
                Ok(None)
            }
        }
    }

    async fn run_streaming(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let Some(sink) = ctx.stream_sink().cloned() else {
            return self.run_non_streaming(ctx).await;
        };
        match self.run_streaming_inner(ctx, &sink).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // §4.4.3 step 4: a provider error becomes both a terminal
                // `{error}` chunk on the sink and a returned error up the
                // chain, never just one or the other.
                sink.send_terminal(Chunk::Error(err.to_string())).await.ok();
                Err(err)
            }
        }
    }

    async fn run_streaming_inner(&self, ctx: &mut ExecutionContext, sink: &crate::context::StreamSink) -> Result<()> {
        let mut state = State::CallProvider;
        loop {
            match state {
                State::CallProvider => {
                    if ctx.round() >= self.max_rounds {
                        state = State::Finalize;
                        continue;
                    }
                    ctx.advance_round();
                    let req = self.build_request(ctx);
                    let response = match self.provider.predict_stream(req, sink.clone()).await {
                        Ok(response) => response,
                        Err(err) if err.is_retryable() => {
                            warn!("streaming provider call failed transiently, falling back to single retry");
                            let req = self.build_request(ctx);
                            self.provider
                                .predict_with_retry(req, &self.retry_config)
                                .await?
                        }
                        Err(err) => return Err(PipelineError::Provider(err)),
                    };
                    ctx.accumulate_usage(response.usage);
                    if response.message.has_tool_calls() {
                        let calls = response.message.tool_calls.clone().unwrap_or_default();
                        ctx.messages_mut().push(response.message);
                        state = State::HaveToolCalls(calls);
                    } else {
                        ctx.set_response(response.message.clone());
                        ctx.messages_mut().push(response.message);
                        state = State::Finalize;
                    }
                }
                State::HaveToolCalls(calls) => {
                    let results = self.execute_tools(ctx, &calls).await;
                    match self.append_tool_results(ctx, &calls, results) {
                        Some(next) => state = next,
                        None => state = State::CallProvider,
                    }
                }
                State::Finalize => {
                    self.finalize(ctx).await?;
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Middleware for ProviderMiddleware {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        if ctx.is_streaming() {
            self.run_streaming(ctx).await?;
        } else {
            self.run_non_streaming(ctx).await?;
        }
        next.call(ctx).await
    }

    fn name(&self) -> &'static str {
        "provider"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Deadline, StreamSink};
    use crate::error::ProviderError;
    use crate::message::{Role, Usage};
    use crate::provider::ChatResponse;
    use crate::tools::{ToolDescriptor, ToolExecutionResult, ToolInvoker};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::watch;

    fn fresh_ctx(messages: Vec<Message>) -> (ExecutionContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let deadline = Deadline::new(
            tokio::time::Instant::now() + std::time::Duration::from_secs(5),
            rx,
        );
        (ExecutionContext::new(messages, deadline), tx)
    }

    struct ScriptedProvider {
        // Each call pops the front of the script.
        script: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn predict(&self, _req: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(ProviderError::Validation("script exhausted".into()));
            }
            let message = script.remove(0);
            Ok(ChatResponse {
                message,
                usage: Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                    estimated_cost_usd: 0.0,
                },
            })
        }

        async fn predict_stream(
            &self,
            _req: ChatRequest,
            _sink: StreamSink,
        ) -> std::result::Result<ChatResponse, ProviderError> {
            unimplemented!()
        }

        fn supports_streaming(&self) -> bool {
            false
        }
    }

    struct Echo;

    #[async_trait]
    impl ToolInvoker for Echo {
        async fn execute(&self, args: Value) -> ToolExecutionResult {
            ToolExecutionResult::Complete {
                content: args.to_string(),
            }
        }
    }

    fn echo_registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(ToolDescriptor::live(
                "echo",
                "echoes",
                json!({"type": "object"}),
                std::time::Duration::from_secs(1),
                Arc::new(Echo),
            ))
            .build()
    }

    #[tokio::test]
    async fn simple_completion_with_no_tool_calls() {
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![Message::assistant(Some("hello".into()), vec![])]),
        });
        let mw = ProviderMiddleware::new(provider, ToolRegistry::new());
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("hi")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response().unwrap().content, "hello");
        assert_eq!(ctx.round(), 1);
    }

    #[tokio::test]
    async fn single_tool_round_then_final_answer() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "echo".into(),
            args: json!({"x": 1}),
        };
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![
                Message::assistant(None, vec![call]),
                Message::assistant(Some("done".into()), vec![]),
            ]),
        });
        let mw = ProviderMiddleware::new(provider, echo_registry());
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("use the tool")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response().unwrap().content, "done");
        assert_eq!(ctx.round(), 2);
        assert!(ctx.messages().iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn parallel_tool_calls_preserve_declared_order() {
        let calls = vec![
            ToolCallRequest {
                id: "a".into(),
                name: "echo".into(),
                args: json!(1),
            },
            ToolCallRequest {
                id: "b".into(),
                name: "echo".into(),
                args: json!(2),
            },
        ];
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![
                Message::assistant(None, calls),
                Message::assistant(Some("done".into()), vec![]),
            ]),
        });
        let mw = ProviderMiddleware::new(provider, echo_registry());
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("go")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        let tool_ids: Vec<&str> = ctx
            .messages()
            .iter()
            .filter_map(|m| m.tool_result.as_ref())
            .map(|tr| tr.tool_call_id.as_str())
            .collect();
        assert_eq!(tool_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn round_cap_synthesizes_final_message() {
        let loop_call = ToolCallRequest {
            id: "x".into(),
            name: "echo".into(),
            args: json!({}),
        };
        let script: Vec<Message> = (0..20)
            .map(|_| Message::assistant(None, vec![loop_call.clone()]))
            .collect();
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(script),
        });
        let mw = ProviderMiddleware::new(provider, echo_registry()).with_max_rounds(3);
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("loop forever")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        assert!(ctx.response().is_some());
        assert_eq!(ctx.round(), 3);
    }

    #[tokio::test]
    async fn call_for_a_tool_outside_the_allow_list_becomes_a_synthetic_failure() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "echo".into(),
            args: json!({}),
        };
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![
                Message::assistant(None, vec![call]),
                Message::assistant(Some("done".into()), vec![]),
            ]),
        });
        let mw = ProviderMiddleware::new(provider, echo_registry());
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("go")]);
        ctx.set_allowed_tools(["some_other_tool".to_string()].into_iter().collect());
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        let tool_message = ctx
            .messages()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_message.content.contains("not permitted by policy"));
    }

    #[tokio::test]
    async fn calls_beyond_the_per_turn_cap_become_synthetic_failures() {
        let calls = vec![
            ToolCallRequest {
                id: "a".into(),
                name: "echo".into(),
                args: json!(1),
            },
            ToolCallRequest {
                id: "b".into(),
                name: "echo".into(),
                args: json!(2),
            },
        ];
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![
                Message::assistant(None, calls),
                Message::assistant(Some("done".into()), vec![]),
            ]),
        });
        let mw = ProviderMiddleware::new(provider, echo_registry());
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("go")]);
        ctx.set_max_tool_calls_per_turn(Some(1));
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        let tool_results: Vec<&str> = ctx
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tool_results[0], "1");
        assert!(tool_results[1].contains("per-turn tool call cap exceeded"));
    }

    #[tokio::test]
    async fn duplicate_tool_call_id_in_a_round_is_dropped() {
        let calls = vec![
            ToolCallRequest {
                id: "dup".into(),
                name: "echo".into(),
                args: json!(1),
            },
            ToolCallRequest {
                id: "dup".into(),
                name: "echo".into(),
                args: json!(2),
            },
        ];
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![
                Message::assistant(None, calls),
                Message::assistant(Some("done".into()), vec![]),
            ]),
        });
        let mw = ProviderMiddleware::new(provider, echo_registry());
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("go")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        let tool_results: Vec<&str> = ctx
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(tool_results[0], "1");
        assert!(tool_results[1].contains("duplicate tool_call id"));
    }

    #[tokio::test]
    async fn pending_tool_result_halts_the_loop() {
        struct Pending;
        #[async_trait]
        impl ToolInvoker for Pending {
            async fn execute(&self, _args: Value) -> ToolExecutionResult {
                ToolExecutionResult::Pending {
                    pending_info: crate::tools::PendingInfo {
                        reason: "awaiting_approval".into(),
                        message: "need a human".into(),
                        callback: None,
                        expires_at: None,
                        metadata: Default::default(),
                    },
                }
            }
        }
        let registry = ToolRegistry::builder()
            .register(ToolDescriptor::live(
                "approve",
                "needs approval",
                json!({}),
                std::time::Duration::from_secs(1),
                Arc::new(Pending),
            ))
            .build();
        let call = ToolCallRequest {
            id: "p1".into(),
            name: "approve".into(),
            args: json!({}),
        };
        let provider = Arc::new(ScriptedProvider {
            script: Mutex::new(vec![Message::assistant(None, vec![call])]),
        });
        let mw = ProviderMiddleware::new(provider, registry);
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("approve this")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        assert!(ctx.response().is_none());
        assert!(ctx.error().is_some());
    }

    #[tokio::test]
    async fn retryable_provider_error_eventually_succeeds() {
        struct FlakyOnce {
            tried: AtomicUsize,
        }
        #[async_trait]
        impl Provider for FlakyOnce {
            async fn predict(
                &self,
                _req: ChatRequest,
            ) -> std::result::Result<ChatResponse, ProviderError> {
                if self.tried.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ProviderError::Transient("overloaded".into()));
                }
                Ok(ChatResponse {
                    message: Message::assistant(Some("recovered".into()), vec![]),
                    usage: Usage::default(),
                })
            }
            async fn predict_stream(
                &self,
                _req: ChatRequest,
                _sink: StreamSink,
            ) -> std::result::Result<ChatResponse, ProviderError> {
                unimplemented!()
            }
            fn supports_streaming(&self) -> bool {
                false
            }
        }
        let provider = Arc::new(FlakyOnce {
            tried: AtomicUsize::new(0),
        });
        let mw = ProviderMiddleware::new(provider, ToolRegistry::new()).with_retry_config(
            RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            },
        );
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("hi")]);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response().unwrap().content, "recovered");
    }

    struct StreamingEcho;

    #[async_trait]
    impl Provider for StreamingEcho {
        async fn predict(&self, _req: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            unimplemented!()
        }

        async fn predict_stream(
            &self,
            _req: ChatRequest,
            sink: StreamSink,
        ) -> std::result::Result<ChatResponse, ProviderError> {
            sink.send(Chunk::TextDelta("hel".into())).await.ok();
            sink.send(Chunk::TextDelta("lo".into())).await.ok();
            Ok(ChatResponse {
                message: Message::assistant(Some("hello".into()), vec![]),
                usage: Usage::default(),
            })
        }

        fn supports_streaming(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn streaming_run_emits_exactly_one_terminal_chunk() {
        let provider = Arc::new(StreamingEcho);
        let mw = ProviderMiddleware::new(provider, ToolRegistry::new());
        let (sink, mut rx) = StreamSink::new(16);
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("hi")]).with_streaming(sink);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        chain.run(&mut ctx).await.unwrap();
        let mut terminal_count = 0;
        while let Some(chunk) = rx.recv().await {
            if chunk.is_terminal() {
                terminal_count += 1;
            }
        }
        assert_eq!(terminal_count, 1);
    }

    #[tokio::test]
    async fn streaming_provider_error_emits_a_terminal_error_chunk_and_returns_err() {
        let provider = Arc::new(crate::testing::StreamingScriptedProvider::new(
            vec!["par".into(), "tial".into()],
            Err(ProviderError::Auth("bad key".into())),
        ));
        let mw = ProviderMiddleware::new(provider, ToolRegistry::new());
        let (sink, mut rx) = StreamSink::new(16);
        let (mut ctx, _tx) = fresh_ctx(vec![Message::user("hi")]).with_streaming(sink);
        let chain = crate::middleware::Chain::new(vec![Arc::new(mw)]);
        let result = chain.run(&mut ctx).await;
        assert!(matches!(
            result,
            Err(PipelineError::Provider(ProviderError::Auth(_)))
        ));
        let mut terminal_chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            if chunk.is_terminal() {
                terminal_chunks.push(chunk);
            }
        }
        assert_eq!(terminal_chunks.len(), 1);
        assert!(matches!(terminal_chunks[0], Chunk::Error(_)));
    }
}
