use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ReplError, ReplResult};
use crate::tokens;

// ─── Message Types ──────────────────────────────────────────────────────────

/// Role in a conversation.
///
/// Messages alternate `user`/`assistant` after any leading `system` message;
/// `tool` entries may appear between a `user` message and the assistant
/// completion that consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tokens: usize,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = tokens::estimate(&content);
        Self {
            role,
            content,
            timestamp: Utc::now(),
            tokens,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Replace the content, recomputing the token stamp.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.tokens = tokens::estimate(&self.content);
    }
}

// ─── Token Usage ─────────────────────────────────────────────────────────────

/// Provider-reported token counts for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

// ─── Tool Definition ─────────────────────────────────────────────────────────

/// Schema for a tool declaration sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ─── Tool Calls ──────────────────────────────────────────────────────────────

/// The three sandbox operations, as a closed set of calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    ListFiles { pattern: String },
    ReadFile { file_path: String },
    WriteFile { file_path: String, content: String },
}

impl ToolCall {
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ListFiles { .. } => "list_files",
            ToolCall::ReadFile { .. } => "read_file",
            ToolCall::WriteFile { .. } => "write_file",
        }
    }

    /// Arguments as a JSON object, for journaling.
    pub fn args(&self) -> Value {
        match self {
            ToolCall::ListFiles { pattern } => json!({ "pattern": pattern }),
            ToolCall::ReadFile { file_path } => json!({ "file_path": file_path }),
            ToolCall::WriteFile { file_path, content } => {
                json!({ "file_path": file_path, "content": content })
            }
        }
    }

    /// Parse a function-call part emitted by the model.
    ///
    /// Applies the same slip corrections as the decision engine: a `path`
    /// key is accepted for `file_path`, and a missing `list_files` pattern
    /// defaults to `*`.
    pub fn from_parts(name: &str, args: &Value) -> ReplResult<Self> {
        let str_arg = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
        let file_path = || str_arg("file_path").or_else(|| str_arg("path"));

        match name {
            "list_files" => Ok(ToolCall::ListFiles {
                pattern: str_arg("pattern")
                    .or_else(file_path)
                    .unwrap_or_else(|| "*".into()),
            }),
            "read_file" => Ok(ToolCall::ReadFile {
                file_path: file_path().ok_or_else(|| {
                    ReplError::MalformedDecision("read_file requires file_path".into())
                })?,
            }),
            "write_file" => Ok(ToolCall::WriteFile {
                file_path: file_path().ok_or_else(|| {
                    ReplError::MalformedDecision("write_file requires file_path".into())
                })?,
                content: str_arg("content").ok_or_else(|| {
                    ReplError::MalformedDecision("write_file requires content".into())
                })?,
            }),
            other => Err(ReplError::MalformedDecision(format!(
                "unknown tool: {other}"
            ))),
        }
    }

    /// Declarations for the three core tools, parameter names verbatim.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "list_files".into(),
                description: "List files matching a glob pattern (supports ** for any depth)."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "pattern": {
                            "type": "string",
                            "description": "Glob pattern to match files (e.g. '*.rs', 'src/**/*.rs')",
                        },
                    },
                }),
            },
            ToolDefinition {
                name: "read_file".into(),
                description: "Read the contents of a file inside the sandbox.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path to the file, relative to the sandbox root",
                        },
                    },
                    "required": ["file_path"],
                }),
            },
            ToolDefinition {
                name: "write_file".into(),
                description: "Write content to a file inside the sandbox, creating parent directories as needed.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path to the file, relative to the sandbox root",
                        },
                        "content": {
                            "type": "string",
                            "description": "Content to write to the file",
                        },
                    },
                    "required": ["file_path", "content"],
                }),
            },
        ]
    }
}

// ─── Tool Decision ───────────────────────────────────────────────────────────

/// Outcome of classifying a user utterance.
///
/// Validated at the decision engine's parse boundary; no optional tool
/// arguments survive past it.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    NoTool { reasoning: String },
    UseTool { call: ToolCall, reasoning: String },
}

impl ToolDecision {
    pub fn requires_tool(&self) -> bool {
        matches!(self, ToolDecision::UseTool { .. })
    }

    pub fn reasoning(&self) -> &str {
        match self {
            ToolDecision::NoTool { reasoning } | ToolDecision::UseTool { reasoning, .. } => {
                reasoning
            }
        }
    }
}

// ─── Turn Metadata ───────────────────────────────────────────────────────────

/// One tool invocation recorded during a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUse {
    pub tool: String,
    pub args: Value,
    pub result_preview: String,
    pub is_error: bool,
}

/// Metadata returned alongside the assistant text for a turn.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnMetadata {
    /// Provider-reported tokens summed over every model call in the turn,
    /// when available.
    pub tokens: Option<usize>,
    pub duration_ms: u64,
    pub tool_uses: Vec<ToolUse>,
}
