//! Environment-driven configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::context::DEFAULT_BUDGET;
use crate::decision::DEFAULT_CACHE_TTL;
use crate::dispatch::{DEFAULT_PREVIEW_CHARS, DEFAULT_TRAMPOLINE_LIMIT};
use crate::error::{ReplError, ReplResult};
use crate::rate::default_rpm_table;

pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_MODEL: &str = "GEMINI_MODEL";
pub const ENV_STRUCTURED_DISPATCH: &str = "GEMINI_STRUCTURED_DISPATCH";
pub const ENV_SYSTEM_PROMPT: &str = "GEMINI_SYSTEM_PROMPT";
pub const ENV_DEV_MODE: &str = "GEMINI_DEV_MODE";

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-lite";
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub api_key: String,
    pub model: String,
    /// Gate for the decision engine; the trampoline is always on.
    pub structured_dispatch: bool,
    pub system_prompt_path: Option<PathBuf>,
    /// Directs session storage to project-local `./logs`.
    pub dev_mode: bool,
    pub context_budget: usize,
    pub rpm_table: HashMap<String, u32>,
    pub trampoline_limit: usize,
    pub preview_chars: usize,
    pub turn_timeout: Duration,
    pub decision_cache_ttl: Duration,
}

impl ConsoleConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            structured_dispatch: true,
            system_prompt_path: None,
            dev_mode: false,
            context_budget: DEFAULT_BUDGET,
            rpm_table: default_rpm_table(),
            trampoline_limit: DEFAULT_TRAMPOLINE_LIMIT,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            decision_cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Read configuration from the environment. A missing API key is a
    /// fatal startup failure.
    pub fn from_env() -> ReplResult<Self> {
        let api_key = std::env::var(ENV_API_KEY)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ReplError::FatalConfig(format!("{ENV_API_KEY} not set")))?;

        let mut config = Self::new(api_key);
        if let Ok(model) = std::env::var(ENV_MODEL) {
            if !model.is_empty() {
                config.model = model;
            }
        }
        config.structured_dispatch =
            parse_flag(std::env::var(ENV_STRUCTURED_DISPATCH).ok().as_deref(), true);
        if let Ok(path) = std::env::var(ENV_SYSTEM_PROMPT) {
            if !path.is_empty() {
                config.system_prompt_path = Some(PathBuf::from(path));
            }
        }
        config.dev_mode = parse_flag(std::env::var(ENV_DEV_MODE).ok().as_deref(), false);
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_context_budget(mut self, budget: usize) -> Self {
        self.context_budget = budget;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_structured_dispatch(mut self, enabled: bool) -> Self {
        self.structured_dispatch = enabled;
        self
    }
}

fn parse_flag(value: Option<&str>, default: bool) -> bool {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("true") => true,
        Some("false") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ConsoleConfig::new("key");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert!(config.structured_dispatch);
        assert!(!config.dev_mode);
        assert_eq!(config.trampoline_limit, 8);
        assert_eq!(config.preview_chars, 2_000);
        assert_eq!(config.turn_timeout, Duration::from_secs(120));
        assert_eq!(config.rpm_table["gemini-2.0-flash-lite"], 30);
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag(Some("true"), false));
        assert!(parse_flag(Some("TRUE"), false));
        assert!(!parse_flag(Some("false"), true));
        assert!(parse_flag(Some("yes"), true)); // unrecognized → default
        assert!(parse_flag(None, true));
        assert!(!parse_flag(None, false));
    }

    #[test]
    fn builder_overrides() {
        let config = ConsoleConfig::new("key")
            .with_model("gemini-2.5-pro")
            .with_context_budget(1_000)
            .with_turn_timeout(Duration::from_secs(5))
            .with_structured_dispatch(false);
        assert_eq!(config.model, "gemini-2.5-pro");
        assert_eq!(config.context_budget, 1_000);
        assert!(!config.structured_dispatch);
    }
}
