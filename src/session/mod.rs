//! Durable session journaling.
//!
//! Each session is an append-only JSONL file: one entry per line, every
//! entry carrying a fresh `uuid` and the `parentUuid` of the previous entry,
//! so the file replays as a total order. Writes are line-atomic (buffered,
//! newline-terminated, flushed); readers tolerate a truncated final line.

pub mod paths;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{ReplError, ReplResult};
use crate::types::Role;

pub use paths::ProjectPaths;

// ─── Entry Model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    User,
    Assistant,
    Command,
    ToolUse,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl EntryMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
}

impl EntryMetadata {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One journaled event. Serialized camelCase (`sessionId`, `parentUuid`);
/// consumers ignore unknown keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_id: Uuid,
    pub uuid: Uuid,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
    #[serde(with = "iso_ms")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<EntryMessage>,
    #[serde(default, skip_serializing_if = "EntryMetadata::is_empty")]
    pub metadata: EntryMetadata,
}

/// ISO-8601 timestamps with millisecond precision.
mod iso_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// ─── Session Addressing ──────────────────────────────────────────────────────

/// How to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRef {
    New,
    Id(Uuid),
    Named(String),
}

/// Deterministic UUID for a session name (v5 in the DNS namespace).
pub fn name_to_uuid(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes())
}

/// Resolve a `--resume` argument: a UUID string, or a short name mapped
/// through its deterministic UUID. Fails with `NotFound` when no session
/// file exists.
pub fn find_session(paths: &ProjectPaths, name_or_id: &str) -> ReplResult<Uuid> {
    if let Ok(id) = Uuid::parse_str(name_or_id) {
        if paths.session_file(&id).exists() {
            return Ok(id);
        }
    }
    let id = name_to_uuid(name_or_id);
    if paths.session_file(&id).exists() {
        return Ok(id);
    }
    Err(ReplError::NotFound(format!("session {name_or_id}")))
}

/// Listing row for `list_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub modified: DateTime<Utc>,
    pub entry_count: usize,
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct SessionStore {
    paths: ProjectPaths,
    session_id: Uuid,
    file: tokio::fs::File,
    parent: Option<Uuid>,
    entry_count: usize,
}

impl SessionStore {
    /// Create or resume a session. Resuming returns all existing entries so
    /// the caller can rebuild its context; the `parentUuid` chain continues
    /// from the last entry.
    pub async fn open(
        paths: ProjectPaths,
        session_ref: SessionRef,
    ) -> ReplResult<(Self, Vec<SessionEntry>)> {
        let session_id = match &session_ref {
            SessionRef::New => Uuid::new_v4(),
            SessionRef::Id(id) => *id,
            SessionRef::Named(name) => {
                let id = name_to_uuid(name);
                record_name(&paths, name, &id).await?;
                id
            }
        };

        let path = paths.session_file(&session_id);
        let entries = if path.exists() {
            read_entries(&path).await?
        } else {
            Vec::new()
        };
        let parent = entries.last().map(|e| e.uuid);
        let entry_count = entries.len();

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::info!(%session_id, resumed = entry_count, "session opened");
        Ok((
            Self {
                paths,
                session_id,
                file,
                parent,
                entry_count,
            },
            entries,
        ))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Append one entry: fresh uuid, parent threaded to the previous entry,
    /// serialized as a single newline-terminated line, flushed.
    pub async fn append(
        &mut self,
        entry_type: EntryType,
        message: Option<EntryMessage>,
        metadata: EntryMetadata,
    ) -> ReplResult<Uuid> {
        let uuid = Uuid::new_v4();
        let entry = SessionEntry {
            session_id: self.session_id,
            uuid,
            parent_uuid: self.parent,
            timestamp: Utc::now(),
            entry_type,
            message,
            metadata,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.parent = Some(uuid);
        self.entry_count += 1;
        Ok(uuid)
    }

    pub async fn log_user(&mut self, content: &str, tokens: usize) -> ReplResult<Uuid> {
        self.append(
            EntryType::User,
            Some(EntryMessage::new(Role::User, content)),
            EntryMetadata {
                tokens: Some(tokens),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn log_assistant(
        &mut self,
        content: &str,
        tokens: Option<usize>,
        duration_ms: u64,
    ) -> ReplResult<Uuid> {
        self.append(
            EntryType::Assistant,
            Some(EntryMessage::new(Role::Assistant, content)),
            EntryMetadata {
                tokens,
                duration_ms: Some(duration_ms),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn log_tool_use(
        &mut self,
        tool: &str,
        args: Value,
        result_preview: &str,
    ) -> ReplResult<Uuid> {
        self.append(
            EntryType::ToolUse,
            None,
            EntryMetadata {
                tool: Some(tool.to_string()),
                args: Some(args),
                result_preview: Some(result_preview.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn log_command(&mut self, command: &str, result: &str) -> ReplResult<Uuid> {
        self.append(
            EntryType::Command,
            Some(EntryMessage {
                role: None,
                content: Some(command.to_string()),
            }),
            EntryMetadata {
                result_preview: Some(result.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn log_error(&mut self, description: &str) -> ReplResult<Uuid> {
        self.append(
            EntryType::Error,
            Some(EntryMessage {
                role: None,
                content: Some(description.to_string()),
            }),
            EntryMetadata::default(),
        )
        .await
    }
}

/// Read all entries from a session file. A malformed line — typically a
/// trailing partial line after a crash — truncates the read at that point.
pub async fn read_entries(path: &Path) -> ReplResult<Vec<SessionEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "truncating at malformed session line");
                break;
            }
        }
    }
    Ok(entries)
}

/// Enumerate known sessions, newest first. Files whose stem is not a UUID
/// are skipped.
pub async fn list_sessions(paths: &ProjectPaths) -> ReplResult<Vec<SessionSummary>> {
    let mut summaries = Vec::new();
    let mut dir = tokio::fs::read_dir(&paths.sessions_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(session_id) = Uuid::parse_str(stem) else {
            continue;
        };
        let meta = entry.metadata().await?;
        let modified: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let entry_count = read_entries(&path).await?.len();
        summaries.push(SessionSummary {
            session_id,
            modified,
            entry_count,
        });
    }
    summaries.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(summaries)
}

/// Append `name → uuid` to the names file unless already present.
async fn record_name(paths: &ProjectPaths, name: &str, id: &Uuid) -> ReplResult<()> {
    let line = format!("{name}\t{id}\n");
    if let Ok(existing) = tokio::fs::read_to_string(&paths.names_file).await {
        if existing.lines().any(|l| l.split('\t').next() == Some(name)) {
            return Ok(());
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.names_file)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
