//! Structured tool dispatch: classify an utterance into a tool decision.
//!
//! The first stage of the dispatch pipeline. A classification prompt asks
//! the model for a JSON verdict matching [`RawDecision`]; the raw object is
//! normalized (common model slips fixed), validated into the
//! [`ToolDecision`] sum type, and memoized per-utterance with a TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::error::{ReplError, ReplResult};
use crate::provider::Provider;
use crate::rate::{retry_with_backoff, RateLimiter};
use crate::types::{ToolCall, ToolDecision};

/// Default TTL for cached decisions.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);

/// Classification runs cold for consistency.
pub const DECISION_TEMPERATURE: f32 = 0.1;

/// Fixed instruction for the classifier call.
pub const DECISION_PROMPT: &str = r#"You are a tool dispatch analyzer for a file system console.

Available tools:
1. list_files - List files matching a pattern
   - Parameters: pattern (optional, defaults to "*")
   - Use pattern for both directory listing and file matching

2. read_file - Read the contents of a specific file
   - Parameters: file_path (required) - MUST use 'file_path' not 'path'

3. write_file - Create or update a file with content
   - Parameters: file_path (required), content (required)

Analyze the user's query and determine if it requires a tool call.

Examples:
- "What files are in src?" → list_files with pattern="src/*"
- "Read the Makefile" → read_file with file_path="Makefile"
- "Create test.txt with Hello" → write_file with file_path="test.txt", content="Hello"
- "Explain recursion" → no tool needed (requires_tool_call=false)

CRITICAL: For read_file and write_file, you MUST use 'file_path' as the parameter name, NOT 'path'.

Important:
- Only suggest tools for actual file operations
- Don't suggest tools for general questions or explanations
- Be conservative - when in doubt, don't use a tool"#;

/// Wire shape of the classifier verdict. All tool fields are optional here;
/// validation into [`ToolDecision`] happens before anything leaves this
/// module.
#[derive(Debug, Default, Deserialize)]
pub struct RawDecision {
    #[serde(default)]
    pub requires_tool_call: bool,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// JSON schema sent with the structured classification request.
pub fn decision_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "requires_tool_call": {"type": "boolean"},
            "tool_name": {
                "type": "string",
                "enum": ["list_files", "read_file", "write_file"],
            },
            "reasoning": {"type": "string"},
            "file_path": {"type": "string"},
            "pattern": {"type": "string"},
            "content": {"type": "string"},
        },
        "required": ["requires_tool_call", "reasoning"],
    })
}

/// Fix common model slips before deserializing: flatten one nested
/// `args`/`parameters` object, rename `path` → `file_path`, and coerce
/// `"true"`/`"false"` strings to booleans.
pub fn normalize(mut value: Value) -> Value {
    let Some(obj) = value.as_object_mut() else {
        return value;
    };

    for key in ["args", "parameters"] {
        if obj.get(key).is_some_and(Value::is_object) {
            if let Some(Value::Object(nested)) = obj.remove(key) {
                for (k, v) in nested {
                    obj.entry(k).or_insert(v);
                }
            }
        }
    }

    if !obj.contains_key("file_path") {
        if let Some(path) = obj.remove("path") {
            obj.insert("file_path".into(), path);
        }
    }

    if let Some(Value::String(s)) = obj.get("requires_tool_call") {
        let coerced = s.eq_ignore_ascii_case("true");
        obj.insert("requires_tool_call".into(), Value::Bool(coerced));
    }

    value
}

/// Validate a normalized raw verdict into the decision sum type.
pub fn validate(raw: RawDecision) -> ReplResult<ToolDecision> {
    let reasoning = raw.reasoning.unwrap_or_default();
    if !raw.requires_tool_call {
        return Ok(ToolDecision::NoTool { reasoning });
    }

    let call = match raw.tool_name.as_deref() {
        Some("list_files") => ToolCall::ListFiles {
            // A file_path slot doubles as the pattern when the model put the
            // target there.
            pattern: raw
                .pattern
                .or(raw.file_path)
                .unwrap_or_else(|| "*".into()),
        },
        Some("read_file") => ToolCall::ReadFile {
            file_path: raw.file_path.ok_or_else(|| {
                ReplError::MalformedDecision("read_file requires file_path".into())
            })?,
        },
        Some("write_file") => ToolCall::WriteFile {
            file_path: raw.file_path.ok_or_else(|| {
                ReplError::MalformedDecision("write_file requires file_path".into())
            })?,
            content: raw.content.ok_or_else(|| {
                ReplError::MalformedDecision("write_file requires content".into())
            })?,
        },
        Some(other) => {
            return Err(ReplError::MalformedDecision(format!(
                "unknown tool: {other}"
            )))
        }
        None => {
            return Err(ReplError::MalformedDecision(
                "requires_tool_call set without tool_name".into(),
            ))
        }
    };

    Ok(ToolDecision::UseTool { call, reasoning })
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, (ToolDecision, Instant)>,
    hits: u64,
    misses: u64,
}

pub struct DecisionEngine {
    provider: Arc<dyn Provider>,
    rate: Arc<RateLimiter>,
    model: String,
    enabled: bool,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl DecisionEngine {
    pub fn new(
        provider: Arc<dyn Provider>,
        rate: Arc<RateLimiter>,
        model: impl Into<String>,
        enabled: bool,
        ttl: Duration,
    ) -> Self {
        Self {
            provider,
            rate,
            model: model.into(),
            enabled,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Classify an utterance. Never fails: classification problems degrade
    /// to a no-tool decision whose reasoning records what went wrong.
    pub async fn analyze(&self, query: &str) -> ToolDecision {
        if !self.enabled {
            return ToolDecision::NoTool {
                reasoning: "structured dispatch disabled".into(),
            };
        }

        if let Some(cached) = self.cache_get(query) {
            tracing::debug!(query, "decision cache hit");
            return cached;
        }
        tracing::debug!(query, "decision cache miss");

        let mut last_error: Option<ReplError> = None;
        for attempt in 0..2 {
            match self.classify(query).await {
                Ok(decision) => {
                    tracing::info!(
                        requires_tool = decision.requires_tool(),
                        reasoning = decision.reasoning(),
                        "tool decision made"
                    );
                    self.cache_put(query, decision.clone());
                    return decision;
                }
                Err(e @ ReplError::MalformedDecision(_)) => {
                    tracing::warn!(attempt, error = %e, "malformed decision, retrying");
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "decision analysis failed");
                    return ToolDecision::NoTool {
                        reasoning: format!("decision analysis failed: {e}"),
                    };
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        ToolDecision::NoTool {
            reasoning: format!("malformed decision twice in a row: {reason}"),
        }
    }

    async fn classify(&self, query: &str) -> ReplResult<ToolDecision> {
        let prompt = format!("{DECISION_PROMPT}\n\nUser query: {query}\n\nAnalyze this query:");
        let schema = decision_schema();

        let raw = retry_with_backoff(&self.model, || async {
            self.rate.acquire(&self.model).await;
            let result = self
                .provider
                .generate_structured(&prompt, &schema, DECISION_TEMPERATURE, &self.model)
                .await;
            self.rate.record(&self.model).await;
            result
        })
        .await?;

        let raw: RawDecision = serde_json::from_value(normalize(raw))
            .map_err(|e| ReplError::MalformedDecision(format!("bad decision shape: {e}")))?;
        validate(raw)
    }

    fn cache_get(&self, query: &str) -> Option<ToolDecision> {
        let mut state = self.state.lock().expect("cache lock");
        let cached = state
            .entries
            .get(query)
            .map(|(decision, stored)| (decision.clone(), *stored));
        match cached {
            Some((decision, stored)) if stored.elapsed() < self.ttl => {
                state.hits += 1;
                Some(decision)
            }
            Some(_) => {
                state.entries.remove(query);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    fn cache_put(&self, query: &str, decision: ToolDecision) {
        let mut state = self.state.lock().expect("cache lock");
        state.entries.insert(query.to_string(), (decision, Instant::now()));
    }

    pub fn clear_cache(&self) {
        let mut state = self.state.lock().expect("cache lock");
        state.entries.clear();
        tracing::info!("decision cache cleared");
    }

    pub fn cache_stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache lock");
        let total = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}
