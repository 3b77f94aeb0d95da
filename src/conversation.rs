use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The caller.
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub call_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub messages: Vec<ConversationMessage>,
}

impl ConversationRecord {
    fn new(call_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: None,
            messages: Vec::new(),
        }
    }
}

/// Where transcripts and the final call status end up.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(&self, call_id: &str, role: Role, text: &str) -> Result<()>;
    async fn finalize(&self, call_id: &str, status: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryConversationStore {
    records: Mutex<HashMap<String, ConversationRecord>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call_id: &str) -> Option<ConversationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(call_id)
            .cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append_message(&self, call_id: &str, role: Role, text: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry(call_id.to_string())
            .or_insert_with(|| ConversationRecord::new(call_id))
            .messages
            .push(ConversationMessage {
                role,
                text: text.to_string(),
                timestamp: Utc::now(),
            });
        Ok(())
    }

    async fn finalize(&self, call_id: &str, status: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(call_id.to_string())
            .or_insert_with(|| ConversationRecord::new(call_id));
        record.ended_at = Some(Utc::now());
        record.status = Some(status.to_string());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConversationLine {
    Message {
        call_id: String,
        role: Role,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Finalized {
        call_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
}

/// Appends one JSON line per event to `<root>/<call_id>.jsonl`.
pub struct FileConversationStore {
    root: PathBuf,
}

impl FileConversationStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        info!(root = %root.display(), "conversation store ready");
        Ok(Self { root })
    }

    pub fn path_for(&self, call_id: &str) -> PathBuf {
        let safe: String = call_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        // channel ids look like "1700000000.42", so append rather than set the extension
        self.root.join(format!("{}.jsonl", safe))
    }

    async fn append_line(&self, call_id: &str, line: &ConversationLine) -> Result<()> {
        let path = self.path_for(call_id);
        let mut data = serde_json::to_vec(line)?;
        data.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        debug!(call_id, path = %path.display(), "conversation line written");
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn append_message(&self, call_id: &str, role: Role, text: &str) -> Result<()> {
        self.append_line(
            call_id,
            &ConversationLine::Message {
                call_id: call_id.to_string(),
                role,
                text: text.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await
    }

    async fn finalize(&self, call_id: &str, status: &str) -> Result<()> {
        self.append_line(
            call_id,
            &ConversationLine::Finalized {
                call_id: call_id.to_string(),
                status: status.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() -> Result<()> {
        let store = MemoryConversationStore::new();
        store.append_message("c1", Role::User, "hello").await?;
        store.append_message("c1", Role::Assistant, "hi there").await?;
        store.finalize("c1", "completed").await?;
        let record = store.record("c1").unwrap();
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].role, Role::Assistant);
        assert_eq!(record.status.as_deref(), Some("completed"));
        assert!(record.ended_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_writes_json_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileConversationStore::new(dir.path().join("conversations")).await?;
        store.append_message("chan/1", Role::User, "hello").await?;
        store.finalize("chan/1", "failed").await?;

        let path = store.path_for("chan/1");
        assert!(path.ends_with("chan_1.jsonl"));
        let content = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<ConversationLine> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(matches!(
            &lines[0],
            ConversationLine::Message { role: Role::User, text, .. } if text == "hello"
        ));
        assert!(matches!(
            &lines[1],
            ConversationLine::Finalized { status, .. } if status == "failed"
        ));
        Ok(())
    }
}
