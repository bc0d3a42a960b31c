use crate::context::SamplingParams;
use serde_json::Value;
use std::collections::HashMap;

/// Policy governing which tools a named prompt may invoke (§3 GLOSSARY
/// "Pack").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolPolicy {
    /// No tool calls permitted.
    None,
    /// Only the named tools are visible to the provider.
    Allow(Vec<String>),
    /// All registered tools are visible.
    AllowAll,
}

/// One named, versioned prompt definition consumed by the prompt-assembly
/// middleware (§4.5). Compiling a pack from source templates is out of
/// scope here — this is the already-resolved record the middleware reads.
#[derive(Debug, Clone)]
pub struct PromptDefinition {
    pub name: String,
    pub system_template: String,
    pub variables: HashMap<String, Value>,
    pub tool_policy: ToolPolicy,
    /// Per-turn cap on tool calls a single round may make (GLOSSARY "Tool
    /// policy"). `None` means unlimited.
    pub max_tool_calls_per_turn: Option<usize>,
    /// Sampling-parameter defaults this prompt applies to every request
    /// (§3 "parameters", §4.5 "applies parameter defaults"). Fields left
    /// unset fall through to the provider middleware's own defaults.
    pub default_params: SamplingParams,
}

/// Source of named prompt definitions (§4.5 "PromptAssembly middleware").
pub trait Pack: Send + Sync {
    fn get(&self, name: &str) -> Option<&PromptDefinition>;
}

/// Fixed in-memory pack: a plain map from name to definition. Sufficient
/// for embedding a small set of prompts without a compiler stage.
#[derive(Default)]
pub struct StaticPack {
    prompts: HashMap<String, PromptDefinition>,
}

impl StaticPack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: PromptDefinition) -> Self {
        self.prompts.insert(prompt.name.clone(), prompt);
        self
    }
}

impl Pack for StaticPack {
    fn get(&self, name: &str) -> Option<&PromptDefinition> {
        self.prompts.get(name)
    }
}
