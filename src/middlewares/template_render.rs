use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Renders `{{variable}}` placeholders in a system-message template against
/// a variable map (§4.5). Deliberately minimal — no conditionals, no loops,
/// no escaping rules beyond literal substitution — since template
/// compilation itself is out of scope. Returns the rendered text plus the
/// name of every placeholder that had no entry in `variables`, in
/// left-to-right order, so the caller decides strict-vs-lenient handling.
pub fn render(template: &str, variables: &HashMap<String, Value>) -> (String, Vec<String>) {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match variables.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        missing.push(key.to_string());
                        out.push_str(&format!("{{{{{key}}}}}"));
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    (out, missing)
}

/// Applies `render` to the system message prepared by `PromptAssembly`
/// using variables staged on the context's metadata bag under
/// `template_vars` (§4.5). In strict mode (the §6 `StrictTemplates`
/// default) an unresolved variable fails the request; in lenient mode it is
/// left as literal `{{name}}` text, order-preserving either way.
pub struct TemplateRender {
    strict: bool,
}

impl TemplateRender {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Strict by default, matching `PipelineConfig::strict_templates`.
    pub fn lenient() -> Self {
        Self { strict: false }
    }
}

impl Default for TemplateRender {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Middleware for TemplateRender {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let variables: HashMap<String, Value> = ctx
            .metadata()
            .get("template_vars")
            .and_then(|v| v.as_object())
            .map(|obj| obj.clone().into_iter().collect())
            .unwrap_or_default();
        if let Some(system) = ctx
            .messages_mut()
            .iter_mut()
            .find(|m| m.role == crate::message::Role::System)
        {
            let (rendered, missing) = render(&system.content, &variables);
            if self.strict && !missing.is_empty() {
                return Err(PipelineError::Validation(format!(
                    "unresolved template variables: {}",
                    missing.join(", ")
                )));
            }
            system.content = rendered;
        }
        next.call(ctx).await
    }

    fn name(&self) -> &'static str {
        "template_render"
    }
}
