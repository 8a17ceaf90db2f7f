//! Two-stage tool dispatch and the model trampoline.
//!
//! Stage one asks the decision engine whether the utterance needs a tool;
//! if so the tool runs immediately and its result is inlined into the user
//! message (the enhanced prompt). Stage two sends the context to the model
//! with tools declared and keeps re-invoking it while responses carry
//! function calls, executing each through the sandbox, until a pure text
//! answer arrives or the iteration cap is hit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::context::ContextManager;
use crate::decision::DecisionEngine;
use crate::error::ReplResult;
use crate::provider::{GenerationConfig, Provider, ProviderResponse};
use crate::rate::{retry_with_backoff, RateLimiter};
use crate::sandbox::Sandbox;
use crate::session::SessionStore;
use crate::types::{Message, Role, ToolCall, ToolDecision, ToolUse, TurnMetadata};

/// Hard cap on trampoline iterations per user turn.
pub const DEFAULT_TRAMPOLINE_LIMIT: usize = 8;

/// Tool results longer than this are truncated before journaling or
/// inlining.
pub const DEFAULT_PREVIEW_CHARS: usize = 2_000;

/// Appended to the returned text when the iteration cap cuts a turn short.
pub const TRAMPOLINE_ANNOTATION: &str = "(trampoline limit reached)";

/// Truncate to `limit` characters with a visible marker.
pub fn truncate_preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}…(truncated)")
}

/// First-turn user message rewritten to carry the tool result inline.
pub fn enhanced_prompt(original: &str, call: &ToolCall, result: &str) -> String {
    format!(
        "{original}\n\n── {name} result ──\n{result}\n\nRespond to the original request using this result.",
        name = call.name(),
    )
}

pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    sandbox: Arc<Sandbox>,
    engine: Arc<DecisionEngine>,
    rate: Arc<RateLimiter>,
    config: GenerationConfig,
    context_file: PathBuf,
    trampoline_limit: usize,
    preview_chars: usize,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn Provider>,
        sandbox: Arc<Sandbox>,
        engine: Arc<DecisionEngine>,
        rate: Arc<RateLimiter>,
        config: GenerationConfig,
        context_file: PathBuf,
    ) -> Self {
        Self {
            provider,
            sandbox,
            engine,
            rate,
            config,
            context_file,
            trampoline_limit: DEFAULT_TRAMPOLINE_LIMIT,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_trampoline_limit(mut self, limit: usize) -> Self {
        self.trampoline_limit = limit;
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    /// Run one full turn: journal the utterance, classify, execute tools,
    /// trampoline the model, journal and return the assistant text.
    pub async fn run_turn(
        &self,
        utterance: &str,
        ctx: &mut ContextManager,
        store: &mut SessionStore,
    ) -> ReplResult<(String, TurnMetadata)> {
        let started = Instant::now();
        let mut meta = TurnMetadata::default();
        let mut total_tokens = 0usize;
        let mut usage_seen = false;

        let user_tokens = ctx.add(Role::User, utterance).tokens;
        store.log_user(utterance, user_tokens).await?;
        self.save_context(ctx).await;

        let decision = self.engine.analyze(utterance).await;

        if let ToolDecision::UseTool { call, .. } = &decision {
            match self.sandbox.execute(call).await {
                Ok(result) => {
                    let preview = truncate_preview(&result, self.preview_chars);
                    store
                        .log_tool_use(call.name(), call.args(), &preview)
                        .await?;
                    meta.tool_uses.push(ToolUse {
                        tool: call.name().into(),
                        args: call.args(),
                        result_preview: preview.clone(),
                        is_error: false,
                    });
                    ctx.set_last_user_content(&enhanced_prompt(utterance, call, &preview));
                    self.save_context(ctx).await;
                }
                Err(e) => {
                    // Proceed without the tool; the journal keeps the failure.
                    let description = e.to_string();
                    tracing::warn!(tool = call.name(), error = %description, "dispatch tool failed");
                    store
                        .log_tool_use(call.name(), call.args(), &format!("error: {description}"))
                        .await?;
                    meta.tool_uses.push(ToolUse {
                        tool: call.name().into(),
                        args: call.args(),
                        result_preview: description,
                        is_error: true,
                    });
                }
            }
        }

        let mut response = self
            .call_model(ctx, &mut total_tokens, &mut usage_seen)
            .await?;

        let mut iterations = 0;
        let mut limit_hit = false;
        while response.has_function_calls() {
            if iterations >= self.trampoline_limit {
                limit_hit = true;
                tracing::warn!(limit = self.trampoline_limit, "trampoline limit reached");
                break;
            }
            iterations += 1;

            for (name, args) in response.function_calls() {
                let (result, is_error) = match ToolCall::from_parts(name, args) {
                    Ok(call) => match self.sandbox.execute(&call).await {
                        Ok(result) => (result, false),
                        Err(e) => (format!("Tool error: {e}"), true),
                    },
                    Err(e) => (format!("Tool error: {e}"), true),
                };
                let preview = truncate_preview(&result, self.preview_chars);
                store.log_tool_use(name, args.clone(), &preview).await?;
                meta.tool_uses.push(ToolUse {
                    tool: name.to_string(),
                    args: args.clone(),
                    result_preview: preview.clone(),
                    is_error,
                });
                ctx.push(Message::tool(format!("{name}: {preview}")));
            }
            self.save_context(ctx).await;

            response = self
                .call_model(ctx, &mut total_tokens, &mut usage_seen)
                .await?;
        }

        let mut text = response.text();
        if limit_hit {
            if text.is_empty() {
                text = TRAMPOLINE_ANNOTATION.to_string();
            } else {
                text = format!("{text}\n\n{TRAMPOLINE_ANNOTATION}");
            }
        }

        ctx.add(Role::Assistant, &text);
        self.save_context(ctx).await;

        meta.tokens = usage_seen.then_some(total_tokens);
        meta.duration_ms = started.elapsed().as_millis() as u64;
        store
            .log_assistant(&text, meta.tokens, meta.duration_ms)
            .await?;

        Ok((text, meta))
    }

    /// All model calls funnel through here: rate slot first, then the
    /// request, with throttling retried under backoff.
    async fn call_model(
        &self,
        ctx: &ContextManager,
        total_tokens: &mut usize,
        usage_seen: &mut bool,
    ) -> ReplResult<ProviderResponse> {
        let tools = ToolCall::definitions();
        let response = retry_with_backoff(&self.config.model, || async {
            self.rate.acquire(&self.config.model).await;
            let result = self.provider.generate(ctx.get(), &tools, &self.config).await;
            self.rate.record(&self.config.model).await;
            result
        })
        .await?;

        if let Some(usage) = response.usage {
            *total_tokens += usage.total();
            *usage_seen = true;
        }
        Ok(response)
    }

    async fn save_context(&self, ctx: &ContextManager) {
        if let Err(e) = ctx.save(&self.context_file).await {
            tracing::warn!(error = %e, "context save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_passes_short_text_through() {
        assert_eq!(truncate_preview("short", 2_000), "short");
    }

    #[test]
    fn preview_truncates_with_marker() {
        let long = "x".repeat(2_500);
        let preview = truncate_preview(&long, 2_000);
        assert_eq!(preview.chars().count(), 2_000 + "…(truncated)".chars().count());
        assert!(preview.ends_with("…(truncated)"));
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let long = "é".repeat(30);
        let preview = truncate_preview(&long, 10);
        assert!(preview.starts_with(&"é".repeat(10)));
        assert!(preview.ends_with("…(truncated)"));
    }

    #[test]
    fn enhanced_prompt_carries_original_and_result() {
        let call = ToolCall::ReadFile {
            file_path: "Makefile".into(),
        };
        let prompt = enhanced_prompt("read the Makefile", &call, "all: build");
        assert!(prompt.starts_with("read the Makefile"));
        assert!(prompt.contains("── read_file result ──"));
        assert!(prompt.contains("all: build"));
    }
}
