use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::message::{Message, Role};
use crate::middleware::{Middleware, Next};
use crate::pack::{Pack, ToolPolicy};
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Looks up a named prompt in a `Pack`, merges its system template into the
/// request's system message (concatenating onto any existing one with a
/// separator, rather than replacing it), stages its variables for
/// `TemplateRender`, and narrows `allowed_tools` to the prompt's declared
/// tool policy intersected with the pack's tool registry (§4.5).
pub struct PromptAssembly {
    pack: Arc<dyn Pack>,
    prompt_name: String,
    registry: Option<ToolRegistry>,
}

impl PromptAssembly {
    pub fn new(pack: Arc<dyn Pack>, prompt_name: impl Into<String>) -> Self {
        Self {
            pack,
            prompt_name: prompt_name.into(),
            registry: None,
        }
    }

    /// Narrow the prompt's declared allow-list to tools actually present in
    /// `registry`, so a pack referencing a tool that was never registered
    /// doesn't end up advertised to the provider (§4.5 "intersected with the
    /// pack's tool registry").
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }
}

#[async_trait]
impl Middleware for PromptAssembly {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let prompt = self.pack.get(&self.prompt_name).ok_or_else(|| {
            PipelineError::Validation(format!("unknown prompt: {}", self.prompt_name))
        })?;

        match ctx.messages_mut().iter_mut().find(|m| m.role == Role::System) {
            Some(existing) => {
                let merged = format!("{}\n\n{}", prompt.system_template, existing.content);
                *existing = Message::system(merged);
            }
            None => {
                ctx.messages_mut()
                    .insert(0, Message::system(prompt.system_template.clone()));
            }
        }

        ctx.metadata_mut().insert(
            "template_vars",
            Value::Object(prompt.variables.clone().into_iter().collect()),
        );

        let mut allowed: HashSet<String> = match &prompt.tool_policy {
            ToolPolicy::None => HashSet::new(),
            ToolPolicy::Allow(names) => names.iter().cloned().collect(),
            ToolPolicy::AllowAll => match &self.registry {
                Some(registry) => registry.names().collect(),
                None => ctx.allowed_tools().clone(),
            },
        };
        if let Some(registry) = &self.registry {
            allowed.retain(|name| registry.contains(name));
        }
        ctx.set_allowed_tools(allowed);
        ctx.set_max_tool_calls_per_turn(prompt.max_tool_calls_per_turn);
        ctx.set_param_overrides(prompt.default_params.clone());

        next.call(ctx).await
    }

    fn name(&self) -> &'static str {
        "prompt_assembly"
    }
}
