//! # gemini-repl-core
//!
//! Core engine for an interactive console that mediates multi-turn
//! conversations with the Gemini API and lets the model drive a small set
//! of sandboxed file tools. The interactive shell (prompt loop, slash
//! commands, rendering) lives outside this crate and drives the
//! [`console::Console`] controller.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Core types: `Message`, `Role`, `ToolCall`, `ToolDecision`, turn metadata |
//! | [`sandbox`] | Path-validated list/read/write file operations under a fixed root |
//! | [`tokens`] | Deterministic token estimation for budget accounting |
//! | [`rate`] | Per-model RPM gate with visible countdown, exponential backoff on throttling |
//! | [`session`] | Append-only JSONL session journal with parent-UUID threading |
//! | [`context`] | Token-budgeted conversation context with trimming and persistence |
//! | [`provider`] | Uniform LLM request/response facade; Gemini implementation |
//! | [`decision`] | Structured classification of utterances into tool decisions |
//! | [`dispatch`] | Two-stage dispatch pipeline and the function-call trampoline |
//! | [`console`] | Controller wiring everything; `handle(utterance)` entry point |
//! | [`config`] | Environment-driven configuration |
//! | [`error`] | Error types with thiserror: `SecurityViolation`, `Throttled`, `RateExceeded`, … |
//!
//! ## Turn flow
//!
//! ```text
//! utterance → Console → Dispatcher → (DecisionEngine ⇄ LLM)
//!                 │                        │
//!                 │                   Sandbox (0..n tool calls)
//!                 │                        │
//!                 │                 LLM trampoline → assistant text
//!                 └── every event journaled to the session JSONL
//! ```

pub mod config;
pub mod console;
pub mod context;
pub mod decision;
pub mod dispatch;
pub mod error;
pub mod provider;
pub mod rate;
pub mod sandbox;
pub mod session;
pub mod tokens;
pub mod types;

pub use error::{ReplError, ReplResult};
pub use types::*;
