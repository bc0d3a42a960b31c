use crate::config::PipelineConfig;
use crate::context::{Deadline, ExecutionContext, StreamSink};
use crate::error::{AdmissionError, PipelineError, Result};
use crate::message::Message;
use crate::middleware::{Chain, Middleware};
use crate::middlewares::{
    ContextExtraction, PromptAssembly, StateStoreLoad, StateStoreSave, TemplateRender, Validator,
};
use crate::pack::Pack;
use crate::provider::Provider;
use crate::provider_middleware::ProviderMiddleware;
use crate::state_store::StateStore;
use crate::tools::ToolRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

/// C3's lifecycle state (§5 "graceful shutdown"). `Ready` admits new
/// executions; `ShuttingDown` drains in-flight ones; `Stopped` rejects
/// everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Ready,
    ShuttingDown,
    Stopped,
}

/// Everything the supervisor needs to build a middleware chain per request,
/// mirroring the teacher's `SubagentConfig`/`AgentLoopConfig` bundling
/// pattern: one plain struct of `Arc`-shared collaborators.
pub struct PipelineBuilder {
    config: PipelineConfig,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    pack: Option<Arc<dyn Pack>>,
    prompt_name: Option<String>,
    state_store: Option<Arc<dyn StateStore>>,
    validator: Option<Validator>,
    model: Option<String>,
    temperature: f32,
    max_tokens: u32,
    top_p: Option<f32>,
    stop: Vec<String>,
    seed: Option<u64>,
}

impl PipelineBuilder {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            config: PipelineConfig::default(),
            provider,
            tools: ToolRegistry::new(),
            pack: None,
            prompt_name: None,
            state_store: None,
            validator: None,
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
            top_p: None,
            stop: Vec::new(),
            seed: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_prompt(mut self, pack: Arc<dyn Pack>, prompt_name: impl Into<String>) -> Self {
        self.pack = Some(pack);
        self.prompt_name = Some(prompt_name.into());
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Construction-time sampling defaults for the provider middleware
    /// (§3 "parameters"); overridden per request by a selected prompt's own
    /// `default_params`, if any.
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

    /// Assembles the standard middleware chain in the order mandated by §4.5:
    /// Context Extraction, State Store Load, Prompt Assembly, Template
    /// Render, Provider, then State Store Save and Dynamic Validator. (Prompt
    /// Assembly runs ahead of Template Render rather than after it, as the
    /// spec text otherwise lists them, because Template Render only has
    /// variables to render once Prompt Assembly has staged them — a
    /// deliberate deviation from the literal ordering, see DESIGN.md.) The
    /// relative order of the validator and the state-store save is governed
    /// by `config.validate_before_save` (§9 open question): each
    /// middleware's post-`next` action runs in the reverse of its pre-`next`
    /// call order, so the one positioned closer to the provider has its
    /// action run first once the chain unwinds.
    pub fn build(self) -> Pipeline {
        let retry_config = crate::provider::RetryConfig {
            max_retries: self.config.max_retries,
            initial_delay_ms: self.config.retry_base_delay.as_millis() as u64,
            max_delay_ms: self.config.retry_max_delay.as_millis() as u64,
            backoff_multiplier: 2.0,
        };
        let mut provider_middleware = ProviderMiddleware::new(self.provider, self.tools.clone())
            .with_max_rounds(self.config.max_rounds)
            .with_retry_config(retry_config)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_sampling(self.top_p, self.stop, self.seed);
        if let Some(model) = self.model {
            provider_middleware = provider_middleware.with_model(model);
        }
        let provider_mw: Arc<dyn Middleware> = Arc::new(provider_middleware);

        let mut middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(ContextExtraction)];

        if let Some(store) = self.state_store.clone() {
            middlewares.push(Arc::new(
                StateStoreLoad::new(store).with_max_history(self.config.max_history_messages),
            ));
        }

        if let (Some(pack), Some(name)) = (self.pack, self.prompt_name) {
            middlewares.push(Arc::new(
                PromptAssembly::new(pack, name).with_registry(self.tools),
            ));
            middlewares.push(Arc::new(TemplateRender::new(self.config.strict_templates)));
        }

        let validator = self.validator.map(Arc::new);
        let state_store_save = self.state_store.map(|store| Arc::new(StateStoreSave::new(store)));

        if self.config.validate_before_save {
            if let Some(store) = state_store_save.clone() {
                middlewares.push(store as Arc<dyn Middleware>);
            }
            if let Some(v) = validator.clone() {
                middlewares.push(v as Arc<dyn Middleware>);
            }
        } else {
            if let Some(v) = validator.clone() {
                middlewares.push(v as Arc<dyn Middleware>);
            }
            if let Some(store) = state_store_save.clone() {
                middlewares.push(store as Arc<dyn Middleware>);
            }
        }

        middlewares.push(provider_mw);

        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let max_concurrent = self.config.max_concurrent_executions;
        Pipeline {
            chain: Chain::new(middlewares),
            config: self.config,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            state: Arc::new(std::sync::Mutex::new(SupervisorState::Ready)),
            cancel_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// C3: admission control, deadline derivation, and graceful shutdown around
/// a `Chain` (§4.4, §5, §6).
pub struct Pipeline {
    chain: Chain,
    config: PipelineConfig,
    semaphore: Arc<Semaphore>,
    state: Arc<std::sync::Mutex<SupervisorState>>,
    cancel_tx: watch::Sender<bool>,
    /// Count of executions currently running, drained to zero by `shutdown`
    /// (§4.3 "waits up to GracefulShutdownTimeout for in-flight count to
    /// drop to zero").
    in_flight: Arc<AtomicUsize>,
}

impl Pipeline {
    pub fn builder(provider: Arc<dyn Provider>) -> PipelineBuilder {
        PipelineBuilder::new(provider)
    }

    fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    fn admit(&self) -> std::result::Result<(), AdmissionError> {
        match self.state() {
            SupervisorState::Ready => Ok(()),
            SupervisorState::ShuttingDown | SupervisorState::Stopped => {
                Err(AdmissionError::ShuttingDown)
            }
        }
    }

    /// Run one request to completion (§6 `Execute`). The derived deadline is
    /// `min(caller_deadline, execution_timeout)` (§5).
    pub async fn execute(
        &self,
        messages: Vec<Message>,
        caller_deadline: Option<tokio::time::Instant>,
    ) -> Result<Message> {
        self.admit()?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PipelineError::Admission(AdmissionError::ShuttingDown))?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let bound = tokio::time::Instant::now() + self.config.execution_timeout;
        let at = caller_deadline.map(|d| d.min(bound)).unwrap_or(bound);
        let deadline = Deadline::new(at, self.cancel_tx.subscribe());

        let mut ctx = ExecutionContext::new(messages, deadline);
        let result = self.chain.run(&mut ctx).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        result?;
        ctx.take_response()
            .ok_or_else(|| PipelineError::Invariant("chain completed without a response".into()))
    }

    /// Run one request in streaming mode (§6 `ExecuteStream`). Returns the
    /// receiving half of the stream immediately; the execution itself runs
    /// on the current task and the caller drives it to completion by
    /// polling the returned receiver.
    pub async fn execute_stream(
        &self,
        messages: Vec<Message>,
        caller_deadline: Option<tokio::time::Instant>,
    ) -> Result<tokio::sync::mpsc::Receiver<crate::context::Chunk>> {
        self.admit()?;
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Admission(AdmissionError::ShuttingDown))?;

        let bound = tokio::time::Instant::now() + self.config.execution_timeout;
        let at = caller_deadline.map(|d| d.min(bound)).unwrap_or(bound);
        let deadline = Deadline::new(at, self.cancel_tx.subscribe());

        let (sink, rx) = StreamSink::new(self.config.stream_buffer_size);
        let mut ctx = ExecutionContext::new(messages, deadline).with_streaming(sink.clone());

        let chain = self.chain_handle();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = chain.run(&mut ctx).await {
                warn!(error = %err, "streaming execution failed");
                let _ = sink
                    .send_terminal(crate::context::Chunk::Error(err.to_string()))
                    .await;
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });

        Ok(rx)
    }

    fn chain_handle(&self) -> ChainHandle {
        ChainHandle {
            chain: Arc::new(Chain::new(self.chain.middlewares_snapshot())),
        }
    }

    /// Stop admitting new executions and wait up to
    /// `graceful_shutdown_timeout` for in-flight ones to finish (§5, §6
    /// `Shutdown`).
    pub async fn shutdown(&self) {
        *self.state.lock().unwrap() = SupervisorState::ShuttingDown;
        info!("pipeline shutdown: draining in-flight executions");
        let deadline = tokio::time::Instant::now() + self.config.graceful_shutdown_timeout;
        while self.in_flight.load(Ordering::Acquire) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let _ = self.cancel_tx.send(true);
        *self.state.lock().unwrap() = SupervisorState::Stopped;
        info!("pipeline shutdown complete");
    }

    pub fn state_label(&self) -> &'static str {
        match self.state() {
            SupervisorState::Ready => "ready",
            SupervisorState::ShuttingDown => "shutting_down",
            SupervisorState::Stopped => "stopped",
        }
    }
}

/// Cheap `Arc`-backed handle so a spawned streaming execution can own a
/// reference to the chain without borrowing the `Pipeline` itself.
struct ChainHandle {
    chain: Arc<Chain>,
}

impl ChainHandle {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<()> {
        self.chain.run(ctx).await
    }
}
