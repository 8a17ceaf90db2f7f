//! In-memory conversation context with token-budgeted trimming.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReplResult;
use crate::session::{EntryType, SessionEntry};
use crate::types::{Message, Role};

/// Default token budget when the model does not dictate one.
pub const DEFAULT_BUDGET: usize = 32_768;

/// Ordered message sequence plus a running token total.
///
/// After any mutation the total stays within the budget: the oldest
/// non-system messages are dropped first, user/assistant pairs go together
/// to preserve alternation, and the most recent user message is never
/// dropped.
pub struct ContextManager {
    messages: Vec<Message>,
    budget: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub message_count: usize,
    pub token_count: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedContext {
    messages: Vec<Message>,
    saved_at: DateTime<Utc>,
}

impl ContextManager {
    pub fn new(budget: usize) -> Self {
        Self {
            messages: Vec::new(),
            budget,
        }
    }

    pub fn with_system_prompt(budget: usize, prompt: &str) -> Self {
        let mut ctx = Self::new(budget);
        if !prompt.is_empty() {
            ctx.messages.push(Message::system(prompt));
        }
        ctx
    }

    /// Rebuild a context from journaled session entries: the `user` and
    /// `assistant` entries, behind any system prompt.
    pub fn rebuild(budget: usize, system_prompt: &str, entries: &[SessionEntry]) -> Self {
        let mut ctx = Self::with_system_prompt(budget, system_prompt);
        for entry in entries {
            let role = match entry.entry_type {
                EntryType::User => Role::User,
                EntryType::Assistant => Role::Assistant,
                _ => continue,
            };
            if let Some(content) = entry.message.as_ref().and_then(|m| m.content.as_deref()) {
                ctx.messages.push(Message::new(role, content));
            }
        }
        ctx.trim();
        ctx
    }

    /// Append a message, stamping its token count, then trim to budget.
    pub fn add(&mut self, role: Role, content: &str) -> &Message {
        self.messages.push(Message::new(role, content));
        self.trim();
        self.messages.last().expect("just pushed")
    }

    /// Append an already-built message (tool results mid-turn).
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.trim();
    }

    /// Rewrite the content of the most recent user message (the enhanced
    /// prompt for a first-turn tool result).
    pub fn set_last_user_content(&mut self, content: &str) {
        if let Some(msg) = self.messages.iter_mut().rev().find(|m| m.role == Role::User) {
            msg.set_content(content);
        }
        self.trim();
    }

    /// Snapshot for an LLM request.
    pub fn get(&self) -> &[Message] {
        &self.messages
    }

    pub fn token_count(&self) -> usize {
        self.messages.iter().map(|m| m.tokens).sum()
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            message_count: self.messages.len(),
            token_count: self.token_count(),
        }
    }

    /// Reset the conversation, keeping system messages.
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    fn trim(&mut self) {
        while self.token_count() > self.budget {
            let Some(oldest) = self.messages.iter().position(|m| m.role != Role::System) else {
                break;
            };
            let last_user = self
                .messages
                .iter()
                .rposition(|m| m.role == Role::User);
            if Some(oldest) == last_user {
                break;
            }
            let paired = self.messages[oldest].role == Role::User
                && self
                    .messages
                    .get(oldest + 1)
                    .is_some_and(|m| m.role == Role::Assistant);
            self.messages.remove(oldest);
            if paired {
                self.messages.remove(oldest);
            }
        }
    }

    /// Persist to `context.json`.
    pub async fn save(&self, path: &Path) -> ReplResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = PersistedContext {
            messages: self.messages.clone(),
            saved_at: Utc::now(),
        };
        tokio::fs::write(path, serde_json::to_string_pretty(&data)?).await?;
        Ok(())
    }

    /// Load a persisted context, if one exists.
    pub async fn load(path: &Path, budget: usize) -> ReplResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(path).await?;
        let data: PersistedContext = serde_json::from_str(&raw)?;
        let mut ctx = Self::new(budget);
        ctx.messages = data.messages;
        ctx.trim();
        Ok(Some(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EntryMessage, EntryMetadata};
    use uuid::Uuid;

    fn wide(role: Role, tokens: usize) -> (Role, String) {
        // 4 bytes per token.
        (role, "x".repeat(tokens * 4))
    }

    #[test]
    fn add_appends_and_counts() {
        let mut ctx = ContextManager::new(1000);
        ctx.add(Role::User, "hello there");
        assert_eq!(ctx.get().len(), 1);
        assert_eq!(ctx.token_count(), 3);
    }

    #[test]
    fn trim_drops_oldest_non_system_first() {
        let mut ctx = ContextManager::with_system_prompt(30, &"s".repeat(40)); // 10 tokens
        let (r, c) = wide(Role::User, 10);
        ctx.add(r, &c);
        let (r, c) = wide(Role::Assistant, 10);
        ctx.add(r, &c);
        // Pushes past budget; the oldest user+assistant pair goes, system stays.
        let (r, c) = wide(Role::User, 15);
        ctx.add(r, &c);

        assert!(ctx.token_count() <= 30);
        assert_eq!(ctx.get()[0].role, Role::System);
        assert_eq!(ctx.get().last().unwrap().role, Role::User);
        assert_eq!(ctx.get().len(), 2);
    }

    #[test]
    fn trim_never_drops_most_recent_user() {
        let mut ctx = ContextManager::new(5);
        let (r, c) = wide(Role::User, 50);
        ctx.add(r, &c);
        // Over budget but the only user message survives.
        assert_eq!(ctx.get().len(), 1);
        assert_eq!(ctx.get()[0].role, Role::User);
    }

    #[test]
    fn trim_drops_pairs_to_preserve_alternation() {
        let mut ctx = ContextManager::new(25);
        let (r, c) = wide(Role::User, 10);
        ctx.add(r, &c);
        let (r, c) = wide(Role::Assistant, 10);
        ctx.add(r, &c);
        let (r, c) = wide(Role::User, 10);
        ctx.add(r, &c);

        // First user would be dropped alone, leaving a leading assistant;
        // the pair goes instead.
        assert_eq!(ctx.get().len(), 1);
        assert_eq!(ctx.get()[0].role, Role::User);
    }

    #[test]
    fn clear_keeps_system_messages() {
        let mut ctx = ContextManager::with_system_prompt(1000, "be helpful");
        ctx.add(Role::User, "hi");
        ctx.add(Role::Assistant, "hello");
        ctx.clear();
        assert_eq!(ctx.get().len(), 1);
        assert_eq!(ctx.get()[0].role, Role::System);
    }

    #[test]
    fn set_last_user_content_rewrites_in_place() {
        let mut ctx = ContextManager::new(1000);
        ctx.add(Role::User, "read the Makefile");
        ctx.add(Role::Tool, "list_files: ...");
        ctx.set_last_user_content("read the Makefile\n\n── tool result ──\nall: build");
        assert!(ctx.get()[0].content.contains("tool result"));
        assert_eq!(ctx.get()[0].tokens, crate::tokens::estimate(&ctx.get()[0].content));
    }

    #[test]
    fn stats_reports_counts() {
        let mut ctx = ContextManager::new(1000);
        ctx.add(Role::User, "12345678"); // 2 tokens
        let stats = ctx.stats();
        assert_eq!(stats.message_count, 1);
        assert_eq!(stats.token_count, 2);
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");

        let mut ctx = ContextManager::with_system_prompt(1000, "be helpful");
        ctx.add(Role::User, "what is 2 + 2?");
        ctx.add(Role::Assistant, "4");
        ctx.save(&path).await.unwrap();

        let loaded = ContextManager::load(&path, 1000).await.unwrap().unwrap();
        assert_eq!(loaded.get(), ctx.get());
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ContextManager::load(&dir.path().join("none.json"), 1000)
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn rebuild_from_entries_keeps_dialogue_only() {
        let sid = Uuid::new_v4();
        let mk = |entry_type, role, content: &str| SessionEntry {
            session_id: sid,
            uuid: Uuid::new_v4(),
            parent_uuid: None,
            timestamp: Utc::now(),
            entry_type,
            message: Some(EntryMessage::new(role, content)),
            metadata: EntryMetadata::default(),
        };
        let entries = vec![
            mk(EntryType::User, Role::User, "read the Makefile"),
            mk(EntryType::ToolUse, Role::Tool, "ignored"),
            mk(EntryType::Assistant, Role::Assistant, "it builds things"),
        ];

        let ctx = ContextManager::rebuild(1000, "sys", &entries);
        let roles: Vec<Role> = ctx.get().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }
}
