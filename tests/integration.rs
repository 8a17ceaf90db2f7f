use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use gemini_repl_core::config::ConsoleConfig;
use gemini_repl_core::console::{Console, StartOptions};
use gemini_repl_core::dispatch::TRAMPOLINE_ANNOTATION;
use gemini_repl_core::error::{ReplError, ReplResult};
use gemini_repl_core::provider::{
    GenerationConfig, Provider, ProviderResponse, ResponsePart,
};
use gemini_repl_core::session::{self, EntryType, ProjectPaths};
use gemini_repl_core::types::{Message, TokenUsage, ToolDefinition};

// ─── Mock Provider ──────────────────────────────────────────────────────────

struct MockProvider {
    structured: Mutex<VecDeque<ReplResult<Value>>>,
    responses: Mutex<VecDeque<ReplResult<ProviderResponse>>>,
    seen: Mutex<Vec<Vec<Message>>>,
    hang_when_empty: bool,
}

impl MockProvider {
    fn new(
        structured: Vec<ReplResult<Value>>,
        responses: Vec<ReplResult<ProviderResponse>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            structured: Mutex::new(structured.into()),
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
            hang_when_empty: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            structured: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            seen: Mutex::new(Vec::new()),
            hang_when_empty: true,
        })
    }

    fn structured_remaining(&self) -> usize {
        self.structured.lock().unwrap().len()
    }

    fn last_request(&self) -> Vec<Message> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

fn no_tool_decision() -> ReplResult<Value> {
    Ok(json!({
        "requires_tool_call": false,
        "reasoning": "no file operation needed",
    }))
}

fn text(body: &str) -> ReplResult<ProviderResponse> {
    Ok(ProviderResponse {
        parts: vec![ResponsePart::Text(body.into())],
        usage: Some(TokenUsage::new(10, 5)),
    })
}

fn call(name: &str, args: Value) -> ReplResult<ProviderResponse> {
    Ok(ProviderResponse::from_call(name, args))
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _config: &GenerationConfig,
    ) -> ReplResult<ProviderResponse> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None if self.hang_when_empty => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            // Non-retryable so an exhausted script fails fast.
            None => Err(ReplError::BadRequest("no more scripted responses".into())),
        }
    }

    async fn generate_structured(
        &self,
        _prompt: &str,
        _schema: &Value,
        _temperature: f32,
        _model: &str,
    ) -> ReplResult<Value> {
        let next = self.structured.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ReplError::BadRequest("no more scripted decisions".into())))
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    console: Console,
    provider: Arc<MockProvider>,
    paths: ProjectPaths,
    _base: tempfile::TempDir,
    sandbox: tempfile::TempDir,
}

async fn start(provider: Arc<MockProvider>, config: ConsoleConfig) -> Harness {
    let base = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::under(base.path(), Path::new("/work/demo")).unwrap();
    let console = Console::start_with(
        config,
        StartOptions::default(),
        paths.clone(),
        provider.clone(),
        sandbox.path(),
    )
    .await
    .unwrap();
    Harness {
        console,
        provider,
        paths,
        _base: base,
        sandbox,
    }
}

fn config() -> ConsoleConfig {
    ConsoleConfig::new("test-key").with_model("test-model")
}

impl Harness {
    async fn entries(&self) -> Vec<session::SessionEntry> {
        let id = self.console.session_id().await;
        session::read_entries(&self.paths.session_file(&id))
            .await
            .unwrap()
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn simple_question_and_answer() {
    let provider = MockProvider::new(vec![no_tool_decision()], vec![text("2 + 2 = 4")]);
    let harness = start(provider, config()).await;

    let (answer, meta) = harness.console.handle("2 + 2").await.unwrap();
    assert!(answer.contains('4'));
    assert!(meta.tool_uses.is_empty());
    assert_eq!(meta.tokens, Some(15));

    let entries = harness.entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].entry_type, EntryType::User);
    assert_eq!(entries[1].entry_type, EntryType::Assistant);
    assert_eq!(entries[0].parent_uuid, None);
    assert_eq!(entries[1].parent_uuid, Some(entries[0].uuid));
}

#[tokio::test]
async fn read_file_tool_enhances_the_prompt() {
    let provider = MockProvider::new(
        vec![Ok(json!({
            "requires_tool_call": true,
            "tool_name": "read_file",
            "file_path": "Makefile",
            "reasoning": "user asked to read a file",
        }))],
        vec![text("The Makefile defines an `all: build` target.")],
    );
    let harness = start(provider, config()).await;
    std::fs::write(harness.sandbox.path().join("Makefile"), "all: build").unwrap();

    let (answer, meta) = harness.console.handle("read the Makefile").await.unwrap();
    assert!(answer.contains("all: build"));
    assert_eq!(meta.tool_uses.len(), 1);
    assert_eq!(meta.tool_uses[0].tool, "read_file");
    assert!(!meta.tool_uses[0].is_error);

    // The model saw the enhanced prompt, not a bare utterance.
    let request = harness.provider.last_request();
    let user = request.iter().find(|m| m.content.contains("read the Makefile")).unwrap();
    assert!(user.content.contains("── read_file result ──"));
    assert!(user.content.contains("all: build"));

    let entries = harness.entries().await;
    assert_eq!(entries.len(), 3); // user, tool_use, assistant
    assert_eq!(entries[1].entry_type, EntryType::ToolUse);
    assert_eq!(entries[1].metadata.tool.as_deref(), Some("read_file"));
    assert_eq!(
        entries[1].metadata.args.as_ref().unwrap()["file_path"],
        "Makefile"
    );
}

#[tokio::test]
async fn write_file_creates_directories() {
    let content = "---- MODULE Fibonacci ----\n====";
    let provider = MockProvider::new(
        vec![Ok(json!({
            "requires_tool_call": true,
            "tool_name": "write_file",
            "file_path": "research/formal/Fibonacci.tla",
            "content": content,
            "reasoning": "user asked to create a file",
        }))],
        vec![text("Created research/formal/Fibonacci.tla.")],
    );
    let harness = start(provider, config()).await;

    let (answer, _) = harness
        .console
        .handle("create research/formal/Fibonacci.tla with a Fibonacci spec")
        .await
        .unwrap();
    assert!(answer.contains("Created"));

    let on_disk = std::fs::read_to_string(
        harness.sandbox.path().join("research/formal/Fibonacci.tla"),
    )
    .unwrap();
    assert_eq!(on_disk, content);

    let entries = harness.entries().await;
    let tool_use = entries
        .iter()
        .find(|e| e.entry_type == EntryType::ToolUse)
        .unwrap();
    assert_eq!(tool_use.metadata.tool.as_deref(), Some("write_file"));
    assert_eq!(
        tool_use.metadata.args.as_ref().unwrap()["file_path"],
        "research/formal/Fibonacci.tla"
    );
}

#[tokio::test]
async fn trampoline_chains_tool_calls_in_order() {
    let provider = MockProvider::new(
        vec![Ok(json!({
            "requires_tool_call": true,
            "tool_name": "list_files",
            "pattern": "**/*",
            "reasoning": "survey the codebase",
        }))],
        vec![
            call("read_file", json!({"file_path": "README.md"})),
            call("read_file", json!({"file_path": "Cargo.toml"})),
            text("A small crate with a README and a manifest."),
        ],
    );
    let harness = start(provider, config()).await;
    std::fs::write(harness.sandbox.path().join("README.md"), "# demo").unwrap();
    std::fs::write(harness.sandbox.path().join("Cargo.toml"), "[package]").unwrap();

    let (answer, meta) = harness
        .console
        .handle("summarize this codebase")
        .await
        .unwrap();
    assert!(answer.contains("small crate"));

    let tools: Vec<(&str, bool)> = meta
        .tool_uses
        .iter()
        .map(|t| (t.tool.as_str(), t.is_error))
        .collect();
    assert_eq!(
        tools,
        vec![("list_files", false), ("read_file", false), ("read_file", false)]
    );

    // Journal records tool uses contiguously, in execution order.
    let entries = harness.entries().await;
    let tool_entries: Vec<&session::SessionEntry> = entries
        .iter()
        .filter(|e| e.entry_type == EntryType::ToolUse)
        .collect();
    assert_eq!(tool_entries.len(), 3);
    assert_eq!(
        tool_entries[1].metadata.args.as_ref().unwrap()["file_path"],
        "README.md"
    );
    assert_eq!(
        tool_entries[2].metadata.args.as_ref().unwrap()["file_path"],
        "Cargo.toml"
    );
    assert_eq!(entries.last().unwrap().entry_type, EntryType::Assistant);
}

#[tokio::test]
async fn path_traversal_is_refused() {
    let provider = MockProvider::new(
        vec![Ok(json!({
            "requires_tool_call": true,
            "tool_name": "read_file",
            "file_path": "../../etc/passwd",
            "reasoning": "user asked to read a file",
        }))],
        vec![text("I can't read files outside the workspace.")],
    );
    let harness = start(provider, config()).await;

    let (answer, meta) = harness
        .console
        .handle("read ../../etc/passwd")
        .await
        .unwrap();
    assert!(!answer.contains("root:"));
    assert_eq!(meta.tool_uses.len(), 1);
    assert!(meta.tool_uses[0].is_error);
    assert!(meta.tool_uses[0].result_preview.contains("Security violation"));

    // The failure is journaled with an error payload.
    let entries = harness.entries().await;
    let tool_use = entries
        .iter()
        .find(|e| e.entry_type == EntryType::ToolUse)
        .unwrap();
    assert!(tool_use
        .metadata
        .result_preview
        .as_ref()
        .unwrap()
        .contains("Security violation"));

    // And the model never saw file contents inlined.
    let request = harness.provider.last_request();
    assert!(request.iter().all(|m| !m.content.contains("── read_file result")));
}

#[tokio::test]
async fn trampoline_tool_errors_feed_back_to_the_model() {
    let provider = MockProvider::new(
        vec![no_tool_decision()],
        vec![
            call("read_file", json!({"file_path": "missing.txt"})),
            text("That file doesn't exist."),
        ],
    );
    let harness = start(provider, config()).await;

    let (answer, meta) = harness.console.handle("what's in missing.txt?").await.unwrap();
    assert!(answer.contains("doesn't exist"));
    assert!(meta.tool_uses[0].is_error);

    // The error became a tool message in the next request.
    let request = harness.provider.last_request();
    let tool_msg = request
        .iter()
        .find(|m| m.content.starts_with("read_file:"))
        .unwrap();
    assert!(tool_msg.content.contains("Tool error"));
}

#[tokio::test]
async fn trampoline_limit_annotates_the_answer() {
    let mut cfg = config();
    cfg.trampoline_limit = 2;
    let provider = MockProvider::new(
        vec![no_tool_decision()],
        vec![
            call("list_files", json!({"pattern": "*"})),
            call("list_files", json!({"pattern": "*"})),
            call("list_files", json!({"pattern": "*"})),
        ],
    );
    let harness = start(provider, cfg).await;

    let (answer, meta) = harness.console.handle("loop forever").await.unwrap();
    assert!(answer.contains(TRAMPOLINE_ANNOTATION));
    // Two iterations executed before the cap.
    assert_eq!(meta.tool_uses.len(), 2);

    let entries = harness.entries().await;
    assert_eq!(entries.last().unwrap().entry_type, EntryType::Assistant);
}

#[tokio::test(start_paused = true)]
async fn throttled_calls_are_retried_with_backoff() {
    let provider = MockProvider::new(
        vec![no_tool_decision()],
        vec![
            Err(ReplError::Throttled("resource exhausted".into())),
            Err(ReplError::Throttled("resource exhausted".into())),
            text("finally through"),
        ],
    );
    let harness = start(provider, config()).await;

    let (answer, _) = harness.console.handle("hello").await.unwrap();
    assert!(answer.contains("finally through"));
}

#[tokio::test(start_paused = true)]
async fn rate_exhaustion_surfaces_and_is_journaled() {
    let throttled = || Err(ReplError::Throttled("resource exhausted".into()));
    let provider = MockProvider::new(
        vec![no_tool_decision()],
        vec![throttled(), throttled(), throttled(), throttled(), throttled()],
    );
    let harness = start(provider, config()).await;

    let err = harness.console.handle("hello").await.unwrap_err();
    assert!(matches!(err, ReplError::RateExceeded { attempts: 5, .. }));

    let entries = harness.entries().await;
    let error_entry = entries
        .iter()
        .find(|e| e.entry_type == EntryType::Error)
        .unwrap();
    assert!(error_entry
        .message
        .as_ref()
        .unwrap()
        .content
        .as_ref()
        .unwrap()
        .contains("Rate limit exhausted"));
}

#[tokio::test]
async fn decision_cache_stabilizes_repeat_utterances() {
    let provider = MockProvider::new(
        vec![no_tool_decision()],
        vec![text("four"), text("still four")],
    );
    let harness = start(provider, config()).await;

    harness.console.handle("2 + 2").await.unwrap();
    harness.console.handle("2 + 2").await.unwrap();

    // One classification served both turns.
    assert_eq!(harness.provider.structured_remaining(), 0);
    let stats = harness.console.decision_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn fallback_mode_skips_classification() {
    let provider = MockProvider::new(vec![], vec![text("plain answer")]);
    let harness = start(provider, config().with_structured_dispatch(false)).await;

    let (answer, meta) = harness.console.handle("read the Makefile").await.unwrap();
    assert_eq!(answer, "plain answer");
    assert!(meta.tool_uses.is_empty());
}

// ─── Session durability ─────────────────────────────────────────────────────

#[tokio::test]
async fn resume_rebuilds_context_and_continues_the_chain() {
    let base = tempfile::tempdir().unwrap();
    let sandbox = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::under(base.path(), Path::new("/work/demo")).unwrap();

    let provider = MockProvider::new(vec![no_tool_decision()], vec![text("4")]);
    let console = Console::start_with(
        config(),
        StartOptions {
            name: Some("math".into()),
            resume: None,
        },
        paths.clone(),
        provider,
        sandbox.path(),
    )
    .await
    .unwrap();
    console.handle("2 + 2").await.unwrap();
    let session_id = console.session_id().await;
    drop(console);

    let provider = MockProvider::new(vec![no_tool_decision()], vec![text("8")]);
    let resumed = Console::start_with(
        config(),
        StartOptions {
            name: None,
            resume: Some("math".into()),
        },
        paths.clone(),
        provider,
        sandbox.path(),
    )
    .await
    .unwrap();
    assert_eq!(resumed.session_id().await, session_id);

    // System prompt + prior user/assistant pair were rebuilt.
    let stats = resumed.context_stats().await;
    assert_eq!(stats.message_count, 3);

    resumed.handle("2 + 6").await.unwrap();
    let entries = session::read_entries(&paths.session_file(&session_id))
        .await
        .unwrap();
    assert_eq!(entries.len(), 4);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].parent_uuid, Some(pair[0].uuid));
    }
}

#[tokio::test]
async fn clear_context_keeps_journal_chain_intact() {
    let provider = MockProvider::new(
        vec![no_tool_decision(), no_tool_decision()],
        vec![text("4"), text("8")],
    );
    let harness = start(provider, config()).await;

    harness.console.handle("2 + 2").await.unwrap();
    harness.console.clear_context().await.unwrap();
    let stats = harness.console.context_stats().await;
    assert_eq!(stats.message_count, 1); // system prompt only

    harness.console.handle("2 + 6").await.unwrap();
    let entries = harness.entries().await;
    // user, assistant, command, user, assistant — one unbroken chain.
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[2].entry_type, EntryType::Command);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].parent_uuid, Some(pair[0].uuid));
    }
}

#[tokio::test]
async fn list_sessions_reports_the_active_session() {
    let provider = MockProvider::new(vec![no_tool_decision()], vec![text("4")]);
    let harness = start(provider, config()).await;
    harness.console.handle("2 + 2").await.unwrap();

    let sessions = harness.console.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, harness.console.session_id().await);
    assert_eq!(sessions[0].entry_count, 2);
}

// ─── Cancellation and timeout ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_aborts_the_turn_and_journals() {
    let provider = MockProvider::hanging();
    let harness = start(provider, config()).await;
    let console = Arc::new(harness.console);

    let turn = {
        let console = console.clone();
        tokio::spawn(async move { console.handle("hang forever").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    console.cancel();

    let err = turn.await.unwrap().unwrap_err();
    assert!(matches!(err, ReplError::Cancelled));

    let id = console.session_id().await;
    let entries = session::read_entries(&harness.paths.session_file(&id))
        .await
        .unwrap();
    let error_entry = entries
        .iter()
        .find(|e| e.entry_type == EntryType::Error)
        .unwrap();
    assert!(error_entry
        .message
        .as_ref()
        .unwrap()
        .content
        .as_ref()
        .unwrap()
        .contains("cancelled"));
}

#[tokio::test(start_paused = true)]
async fn timeout_aborts_the_turn() {
    let provider = MockProvider::hanging();
    let harness = start(provider, config().with_turn_timeout(Duration::from_secs(1))).await;

    let err = harness.console.handle("hang forever").await.unwrap_err();
    assert!(matches!(err, ReplError::Timeout(1)));

    let entries = harness.entries().await;
    assert!(entries.iter().any(|e| e.entry_type == EntryType::Error));
}
