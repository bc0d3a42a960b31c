use crate::context::{Chunk, ExecutionContext};
use crate::error::{PipelineError, Result};
use crate::middleware::{Middleware, Next};
use async_trait::async_trait;

/// A single check against the finished response. `required` rules fail the
/// whole execution (`PipelineError::Validation`) when they return `false`;
/// non-required rules only record a warning on the context's `error` field
/// (§4.5 "Dynamic Validator").
pub struct ValidationRule {
    pub name: &'static str,
    pub required: bool,
    pub check: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl ValidationRule {
    pub fn required(name: &'static str, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name,
            required: true,
            check: Box::new(check),
        }
    }

    pub fn advisory(name: &'static str, check: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name,
            required: false,
            check: Box::new(check),
        }
    }
}

/// Runs a set of rules against the assembled response once the rest of the
/// chain has produced one, whether the execution was streamed or not — the
/// provider writes chunks straight to the caller's `StreamSink`, so
/// streaming mode validates the same final `ctx.response()` a beat after the
/// last chunk, rather than re-checking a reconstructed buffer on every
/// chunk (§4.5's cumulative-buffer mode is not implemented).
pub struct Validator {
    rules: Vec<ValidationRule>,
}

impl Validator {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self { rules }
    }

    fn run_rules(&self, content: &str) -> std::result::Result<Vec<String>, PipelineError> {
        let mut warnings = Vec::new();
        for rule in &self.rules {
            if !(rule.check)(content) {
                if rule.required {
                    return Err(PipelineError::Validation(format!(
                        "required rule '{}' failed",
                        rule.name
                    )));
                }
                warnings.push(rule.name.to_string());
            }
        }
        Ok(warnings)
    }
}

#[async_trait]
impl Middleware for Validator {
    async fn process(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<()> {
        let result = next.call(ctx).await;
        result?;

        let Some(response) = ctx.response().cloned() else {
            return Ok(());
        };
        match self.run_rules(&response.content) {
            Ok(warnings) if warnings.is_empty() => Ok(()),
            Ok(warnings) => {
                ctx.set_error(format!("advisory validation warnings: {}", warnings.join(", ")));
                Ok(())
            }
            Err(err) => {
                if let Some(sink) = ctx.stream_sink() {
                    sink.send_terminal(Chunk::Error(err.to_string())).await.ok();
                }
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "validator"
    }
}
