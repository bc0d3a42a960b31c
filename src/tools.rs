use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Whether a tool's declared invocation is actually dispatched to an
/// `invoker_ref`, or short-circuited to a canned `mock_result` (useful for
/// fixtures and replay-driven tests without a live `ToolInvoker`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    Live,
    Mock,
}

/// Static description of a callable tool, registered once at pipeline
/// construction and never mutated afterward (§3).
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Option<Value>,
    pub mode: ToolMode,
    pub timeout: Duration,
    pub mock_result: Option<ToolExecutionResult>,
    pub invoker: Option<Arc<dyn ToolInvoker>>,
}

impl ToolDescriptor {
    pub fn live(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        timeout: Duration,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ToolMode::Live,
            timeout,
            mock_result: None,
            invoker: Some(invoker),
        }
    }

    pub fn mock(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        result: ToolExecutionResult,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ToolMode::Mock,
            timeout: Duration::from_secs(30),
            mock_result: Some(result),
            invoker: None,
        }
    }

    pub fn to_provider_schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

/// Human-in-the-loop suspension detail attached to a `Pending` result (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInfo {
    pub reason: String,
    pub message: String,
    pub callback: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Outcome of dispatching a single tool call (§3, §4.3, §4.4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolExecutionResult {
    Complete { content: String },
    Pending { pending_info: PendingInfo },
    Failed { error: String },
}

impl ToolExecutionResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Render as the content of the synthetic `role = tool` message fed back
    /// to the provider on the next round (§4.4.2 step 5).
    pub fn as_message_content(&self) -> String {
        match self {
            Self::Complete { content } => content.clone(),
            Self::Pending { pending_info } => {
                format!("[pending: {}] {}", pending_info.reason, pending_info.message)
            }
            Self::Failed { error } => format!("[tool error] {error}"),
        }
    }
}

/// Executes a single named tool call. Implementations own whatever side
/// effects the tool performs; the registry and provider middleware only see
/// this trait (§4.3).
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn execute(&self, args: Value) -> ToolExecutionResult;
}

/// Immutable, O(1)-lookup map of tool name to descriptor (§4.3 "ToolRegistry:
/// name -> ToolDescriptor map"). Built once at pipeline construction.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Every registered tool name, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.tools.keys().cloned()
    }

    /// Schemas for tools in `allowed`, in registration order filtered by
    /// membership — fed to the provider as the declared tool list.
    pub fn schemas_for<'a>(&'a self, allowed: &std::collections::HashSet<String>) -> Vec<Value> {
        self.tools
            .values()
            .filter(|t| allowed.is_empty() || allowed.contains(&t.name))
            .map(ToolDescriptor::to_provider_schema)
            .collect()
    }

    /// Dispatch a single call: mock tools resolve immediately to their
    /// canned result, live tools delegate to their `invoker` under the
    /// descriptor's own timeout (§4.3, §4.4.2 "ExecuteTools").
    pub async fn execute(&self, name: &str, args: Value) -> ToolExecutionResult {
        let Some(descriptor) = self.tools.get(name) else {
            return ToolExecutionResult::Failed {
                error: format!("unknown tool: {name}"),
            };
        };
        match descriptor.mode {
            ToolMode::Mock => descriptor
                .mock_result
                .clone()
                .unwrap_or(ToolExecutionResult::Failed {
                    error: format!("tool {name} registered as mock with no mock_result"),
                }),
            ToolMode::Live => {
                let Some(invoker) = &descriptor.invoker else {
                    return ToolExecutionResult::Failed {
                        error: format!("tool {name} registered as live with no invoker"),
                    };
                };
                match tokio::time::timeout(descriptor.timeout, invoker.execute(args)).await {
                    Ok(result) => result,
                    Err(_) => ToolExecutionResult::Failed {
                        error: format!("tool {name} timed out after {:?}", descriptor.timeout),
                    },
                }
            }
        }
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, descriptor: ToolDescriptor) -> Self {
        self.tools.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolInvoker for Echo {
        async fn execute(&self, args: Value) -> ToolExecutionResult {
            ToolExecutionResult::Complete {
                content: args.to_string(),
            }
        }
    }

    struct Never;

    #[async_trait]
    impl ToolInvoker for Never {
        async fn execute(&self, _args: Value) -> ToolExecutionResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn live_tool_executes_through_invoker() {
        let registry = ToolRegistry::builder()
            .register(ToolDescriptor::live(
                "echo",
                "echoes input",
                serde_json::json!({}),
                Duration::from_secs(1),
                Arc::new(Echo),
            ))
            .build();
        let result = registry.execute("echo", serde_json::json!({"x": 1})).await;
        assert!(matches!(result, ToolExecutionResult::Complete { .. }));
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_panicking() {
        let registry = ToolRegistry::new();
        let result = registry.execute("missing", Value::Null).await;
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn live_tool_exceeding_timeout_fails() {
        let registry = ToolRegistry::builder()
            .register(ToolDescriptor::live(
                "slow",
                "never returns",
                serde_json::json!({}),
                Duration::from_millis(10),
                Arc::new(Never),
            ))
            .build();
        let result = registry.execute("slow", Value::Null).await;
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn mock_tool_returns_canned_result() {
        let registry = ToolRegistry::builder()
            .register(ToolDescriptor::mock(
                "canned",
                "always pending",
                serde_json::json!({}),
                ToolExecutionResult::Pending {
                    pending_info: PendingInfo {
                        reason: "awaiting_approval".into(),
                        message: "needs a human".into(),
                        callback: None,
                        expires_at: None,
                        metadata: HashMap::new(),
                    },
                },
            ))
            .build();
        let result = registry.execute("canned", Value::Null).await;
        assert!(result.is_pending());
    }
}
