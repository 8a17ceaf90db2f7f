//! LLM provider abstraction.
//!
//! The rest of the crate talks to the model through the [`Provider`] trait:
//! `generate` for conversational calls with declared tools, and
//! `generate_structured` for schema-constrained JSON (the decision engine).
//! [`GeminiProvider`] is the production implementation.

mod gemini;

pub use gemini::GeminiProvider;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ReplResult;
use crate::types::{Message, TokenUsage, ToolDefinition};

/// One part of a model response envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    FunctionCall { name: String, args: Value },
}

/// Uniform response shape: zero or more text parts, zero or more
/// function-call parts, and usage metadata when the provider reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub parts: Vec<ResponsePart>,
    pub usage: Option<TokenUsage>,
}

impl ProviderResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ResponsePart::Text(text.into())],
            usage: None,
        }
    }

    pub fn from_call(name: impl Into<String>, args: Value) -> Self {
        Self {
            parts: vec![ResponsePart::FunctionCall {
                name: name.into(),
                args,
            }],
            usage: None,
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ResponsePart::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Function-call parts in emission order.
    pub fn function_calls(&self) -> Vec<(&str, &Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ResponsePart::FunctionCall { name, args } => Some((name.as_str(), args)),
                _ => None,
            })
            .collect()
    }

    pub fn has_function_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ResponsePart::FunctionCall { .. }))
    }
}

/// Generation settings for conversational calls.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl GenerationConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_output_tokens: None,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Conversational completion over the full message sequence, with the
    /// core tools declared.
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        config: &GenerationConfig,
    ) -> ReplResult<ProviderResponse>;

    /// Schema-constrained JSON generation for classification prompts.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        temperature: f32,
        model: &str,
    ) -> ReplResult<Value>;
}
