//! Conversations on disk: one JSON file holding every conversation (most
//! recently updated first), the active conversation and the chosen voice.

use anyhow::Context;
use hearth_voice::Conversation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    conversations: Vec<Conversation>,
    #[serde(default)]
    active: Option<String>,
    #[serde(default)]
    voice: Option<String>,
}

pub struct SessionStore {
    path: PathBuf,
    data: StoreFile,
}

impl SessionStore {
    /// A missing file is an empty store; an unreadable one is set aside with
    /// a warning rather than blocking startup.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "session file unreadable; starting empty");
                    StoreFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.data.conversations
    }

    pub fn active_id(&self) -> Option<&str> {
        self.data.active.as_deref()
    }

    /// The active conversation, or a fresh one when there is none.
    pub fn active_or_new(&self) -> Conversation {
        self.active_id()
            .and_then(|id| self.data.conversations.iter().find(|c| c.id == id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_active(&mut self, id: &str) -> anyhow::Result<()> {
        self.data.active = Some(id.to_string());
        self.flush()
    }

    /// Insert or replace, moving the conversation to the front. Empty
    /// conversations are not worth keeping and are skipped.
    pub fn save(&mut self, conversation: &Conversation) -> anyhow::Result<()> {
        if conversation.messages.is_empty() {
            return Ok(());
        }
        self.data.conversations.retain(|c| c.id != conversation.id);
        self.data.conversations.insert(0, conversation.clone());
        self.data.active = Some(conversation.id.clone());
        self.flush()
    }

    pub fn delete(&mut self, id: &str) -> anyhow::Result<bool> {
        let before = self.data.conversations.len();
        self.data.conversations.retain(|c| c.id != id);
        if self.data.active.as_deref() == Some(id) {
            self.data.active = None;
        }
        let removed = self.data.conversations.len() != before;
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    pub fn voice(&self) -> Option<&str> {
        self.data.voice.as_deref()
    }

    pub fn set_voice(&mut self, voice: &str) -> anyhow::Result<()> {
        self.data.voice = Some(voice.to_string());
        self.flush()
    }

    fn flush(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}
