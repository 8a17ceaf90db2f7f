//! The console controller.
//!
//! Owns the session lifecycle: opens or resumes a session, loads the system
//! prompt, wires the sandbox, rate limiter, decision engine, and dispatcher,
//! and exposes `handle` as the single entry point the shell drives. Turns
//! are single-flight per session; a second `handle` call queues behind the
//! first. Each turn runs under a total timeout, and `cancel` aborts the
//! in-flight turn at its next suspension point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::config::ConsoleConfig;
use crate::context::{ContextManager, ContextStats};
use crate::decision::{CacheStats, DecisionEngine};
use crate::dispatch::Dispatcher;
use crate::error::{ReplError, ReplResult};
use crate::provider::{GeminiProvider, GenerationConfig, Provider};
use crate::rate::{RateEvent, RateLimiter};
use crate::sandbox::Sandbox;
use crate::session::{self, ProjectPaths, SessionRef, SessionStore, SessionSummary};
use crate::types::TurnMetadata;

/// Fallback when no system prompt file is configured or present.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant operating a sandboxed file console. \
You can list, read, and write files inside the workspace when the user asks for file operations. \
Keep answers concise.";

const PROJECT_SYSTEM_PROMPT: &str = "resources/system_prompt.txt";

/// Session addressing passed in by the shell's CLI flags.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// `--name <s>`: open a named session (deterministic UUID).
    pub name: Option<String>,
    /// `--resume <uuid|name>`: resume an existing session.
    pub resume: Option<String>,
}

struct TurnState {
    ctx: ContextManager,
    store: SessionStore,
}

pub struct Console {
    state: Mutex<TurnState>,
    dispatcher: Dispatcher,
    engine: Arc<DecisionEngine>,
    paths: ProjectPaths,
    cancel: Notify,
    turn_timeout: Duration,
    system_prompt: String,
    budget: usize,
    rate_events: std::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<RateEvent>>>,
}

impl Console {
    /// Start against the real Gemini endpoint, sandboxed to the current
    /// working directory.
    pub async fn start(config: ConsoleConfig, options: StartOptions) -> ReplResult<Self> {
        let paths = ProjectPaths::resolve(config.dev_mode)?;
        let provider: Arc<dyn Provider> = Arc::new(GeminiProvider::new(config.api_key.clone()));
        let sandbox_root = std::env::current_dir()?;
        Self::start_with(config, options, paths, provider, sandbox_root).await
    }

    /// Start with explicit paths, provider, and sandbox root (tests, shells
    /// with their own wiring).
    pub async fn start_with(
        config: ConsoleConfig,
        options: StartOptions,
        paths: ProjectPaths,
        provider: Arc<dyn Provider>,
        sandbox_root: impl Into<PathBuf>,
    ) -> ReplResult<Self> {
        let session_ref = if let Some(target) = &options.resume {
            SessionRef::Id(session::find_session(&paths, target)?)
        } else if let Some(name) = &options.name {
            SessionRef::Named(name.clone())
        } else {
            SessionRef::New
        };

        let (store, entries) = SessionStore::open(paths.clone(), session_ref).await?;
        let system_prompt = resolve_system_prompt(&config).await?;
        let budget = config.context_budget;
        let ctx = if entries.is_empty() {
            ContextManager::with_system_prompt(budget, &system_prompt)
        } else {
            ContextManager::rebuild(budget, &system_prompt, &entries)
        };

        let sandbox = Arc::new(Sandbox::new(sandbox_root)?);
        let (rate_tx, rate_rx) = tokio::sync::mpsc::unbounded_channel();
        let rate = Arc::new(RateLimiter::new(config.rpm_table.clone()).with_events(rate_tx));
        let engine = Arc::new(DecisionEngine::new(
            provider.clone(),
            rate.clone(),
            config.model.clone(),
            config.structured_dispatch,
            config.decision_cache_ttl,
        ));
        let dispatcher = Dispatcher::new(
            provider,
            sandbox,
            engine.clone(),
            rate,
            GenerationConfig::for_model(config.model.clone()),
            paths.context_file.clone(),
        )
        .with_trampoline_limit(config.trampoline_limit)
        .with_preview_chars(config.preview_chars);

        Ok(Self {
            state: Mutex::new(TurnState { ctx, store }),
            dispatcher,
            engine,
            paths,
            cancel: Notify::new(),
            turn_timeout: config.turn_timeout,
            system_prompt,
            budget,
            rate_events: std::sync::Mutex::new(Some(rate_rx)),
        })
    }

    /// Take the rate-limiter countdown stream. The shell drains it to
    /// render waits and ticks; can only be taken once.
    pub fn take_rate_events(
        &self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<RateEvent>> {
        self.rate_events.lock().expect("rate events lock").take()
    }

    /// Run one turn for an utterance. Surfaced failures are journaled as
    /// `error` entries before being returned.
    pub async fn handle(&self, utterance: &str) -> ReplResult<(String, TurnMetadata)> {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        let result = {
            let turn = self
                .dispatcher
                .run_turn(utterance, &mut state.ctx, &mut state.store);
            tokio::select! {
                outcome = tokio::time::timeout(self.turn_timeout, turn) => match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ReplError::Timeout(self.turn_timeout.as_secs())),
                },
                _ = self.cancel.notified() => Err(ReplError::Cancelled),
            }
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(journal_err) = state.store.log_error(&e.to_string()).await {
                    tracing::error!(error = %journal_err, "failed to journal error entry");
                }
                Err(e)
            }
        }
    }

    /// Abort the in-flight turn at its next suspension point. Tool writes
    /// already flushed stay on disk.
    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    /// Reset the in-memory context to the system prompt. The session's
    /// `parentUuid` chain stays intact so the journal remains a faithful
    /// replay.
    pub async fn clear_context(&self) -> ReplResult<()> {
        let mut state = self.state.lock().await;
        state.ctx.clear();
        state.ctx.save(&self.paths.context_file).await?;
        state.store.log_command("/clear", "context cleared").await?;
        Ok(())
    }

    pub async fn list_sessions(&self) -> ReplResult<Vec<SessionSummary>> {
        session::list_sessions(&self.paths).await
    }

    /// Switch to another session by UUID or name, rebuilding the context
    /// from its journal.
    pub async fn resume(&self, target: &str) -> ReplResult<Uuid> {
        let id = session::find_session(&self.paths, target)?;
        let (store, entries) = SessionStore::open(self.paths.clone(), SessionRef::Id(id)).await?;
        let ctx = ContextManager::rebuild(self.budget, &self.system_prompt, &entries);
        let mut state = self.state.lock().await;
        *state = TurnState { ctx, store };
        Ok(id)
    }

    pub async fn session_id(&self) -> Uuid {
        self.state.lock().await.store.session_id()
    }

    pub async fn context_stats(&self) -> ContextStats {
        self.state.lock().await.ctx.stats()
    }

    pub fn decision_cache_stats(&self) -> CacheStats {
        self.engine.cache_stats()
    }
}

/// System prompt resolution order: the configured override path, then the
/// project-local `resources/system_prompt.txt`, then the built-in default.
async fn resolve_system_prompt(config: &ConsoleConfig) -> ReplResult<String> {
    if let Some(path) = &config.system_prompt_path {
        if let Some(prompt) = read_prompt(path).await? {
            return Ok(prompt);
        }
    }
    if let Some(prompt) = read_prompt(Path::new(PROJECT_SYSTEM_PROMPT)).await? {
        return Ok(prompt);
    }
    Ok(DEFAULT_SYSTEM_PROMPT.to_string())
}

async fn read_prompt(path: &Path) -> ReplResult<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = tokio::fs::read_to_string(path).await?;
    let trimmed = text.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}
