//! Chat library: the chat index plus one JSON file per conversation.
//!
//! `<chats>/index.json` is `{"chats": [{"title", "filename"}]}` and each chat
//! file is `{"title", "history": [...]}`. The index is rewritten on every
//! create, rename and delete.

use super::conversation::{Conversation, Message};
use crate::persist::{self, PersistError};
use crate::settings::{SettingsError, SettingsStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const INDEX_FILE: &str = "index.json";
const MAX_SLUG_LEN: usize = 40;

static SLUG_JUNK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("No chat named '{0}'")]
    NoSuchChat(String),

    #[error("Chat title cannot be empty")]
    EmptyTitle,

    #[error("Failed to remove chat settings: {0}")]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatIndexEntry {
    pub title: String,
    pub filename: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexDocument {
    #[serde(default)]
    chats: Vec<ChatIndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatDocument {
    #[serde(default)]
    title: String,
    #[serde(default)]
    history: Vec<Message>,
}

#[derive(Debug)]
pub struct ChatLibrary {
    dir: PathBuf,
    entries: Vec<ChatIndexEntry>,
}

impl ChatLibrary {
    /// Open the library in `dir`. A corrupt index is replaced by an empty one.
    pub fn open(dir: &Path) -> Self {
        let index = dir.join(INDEX_FILE);
        let (entries, reset) = match persist::read_json::<IndexDocument>(&index) {
            Ok(Some(doc)) => (doc.chats, false),
            Ok(None) => (Vec::new(), false),
            Err(e) => {
                log::warn!("[CHAT] {}; starting with an empty chat list", e);
                (Vec::new(), true)
            }
        };

        let library = Self {
            dir: dir.to_path_buf(),
            entries,
        };
        if reset {
            if let Err(e) = library.save_index() {
                log::error!("[CHAT] Could not reset chat index: {}", e);
            }
        }
        log::info!("[CHAT] {} chat(s) in {}", library.entries.len(), dir.display());
        library
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[ChatIndexEntry] {
        &self.entries
    }

    pub fn chat_file(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Create and persist a new chat seeded with `system_prompt`.
    pub fn create(&mut self, title: &str, system_prompt: &str) -> Result<Conversation, ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::EmptyTitle);
        }
        let filename = self.unique_filename(title);
        let conversation = Conversation::new(filename.clone(), title, system_prompt);

        self.write_chat(&conversation)?;
        self.entries.push(ChatIndexEntry {
            title: title.to_string(),
            filename,
        });
        self.save_index()?;
        log::info!("[CHAT] Created '{}' ({})", conversation.title, conversation.id);
        Ok(conversation)
    }

    /// Load a chat. A missing or unreadable file yields a conversation with
    /// only `fallback_system`, which is written back.
    pub fn load(&self, filename: &str, fallback_system: &str) -> Result<Conversation, ChatError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.filename == filename)
            .ok_or_else(|| ChatError::NoSuchChat(filename.to_string()))?;

        let doc = match persist::read_json::<ChatDocument>(&self.chat_file(filename)) {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => None,
            Err(e) => {
                log::warn!("[CHAT] {}; resetting chat history", e);
                None
            }
        };

        match doc {
            Some(doc) => Ok(Conversation {
                id: filename.to_string(),
                title: if doc.title.is_empty() { entry.title.clone() } else { doc.title },
                messages: doc.history,
            }),
            None => {
                let fresh = Conversation::new(filename, entry.title.clone(), fallback_system);
                self.write_chat(&fresh)?;
                Ok(fresh)
            }
        }
    }

    /// Persist the full conversation.
    pub fn save(&self, conversation: &Conversation) -> Result<(), ChatError> {
        self.write_chat(conversation)
    }

    pub fn rename(&mut self, conversation: &mut Conversation, title: &str) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::EmptyTitle);
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.filename == conversation.id)
            .ok_or_else(|| ChatError::NoSuchChat(conversation.id.clone()))?;

        entry.title = title.to_string();
        conversation.title = title.to_string();
        self.write_chat(conversation)?;
        self.save_index()?;
        log::info!("[CHAT] Renamed {} to '{}'", conversation.id, title);
        Ok(())
    }

    /// Delete the chat file, its settings file and the index entry. The index
    /// entry survives if either file could not be removed.
    pub fn delete(&mut self, filename: &str, settings: &mut SettingsStore) -> Result<(), ChatError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.filename == filename)
            .ok_or_else(|| ChatError::NoSuchChat(filename.to_string()))?;

        persist::remove_file(&self.chat_file(filename))?;
        settings.forget_chat(filename)?;

        self.entries.remove(idx);
        self.save_index()?;
        log::info!("[CHAT] Deleted {}", filename);
        Ok(())
    }

    fn write_chat(&self, conversation: &Conversation) -> Result<(), ChatError> {
        let doc = ChatDocument {
            title: conversation.title.clone(),
            history: conversation.messages.clone(),
        };
        persist::write_json(&self.chat_file(&conversation.id), &doc)?;
        Ok(())
    }

    fn save_index(&self) -> Result<(), ChatError> {
        let doc = IndexDocument {
            chats: self.entries.clone(),
        };
        persist::write_json(&self.dir.join(INDEX_FILE), &doc)?;
        Ok(())
    }

    fn unique_filename(&self, title: &str) -> String {
        let base = slugify(title);
        let taken = |name: &str| {
            self.entries.iter().any(|e| e.filename == name) || self.dir.join(name).exists()
        };

        let mut candidate = format!("{}.json", base);
        let mut n = 2;
        while taken(&candidate) || candidate == INDEX_FILE {
            candidate = format!("{}-{}.json", base, n);
            n += 1;
        }
        candidate
    }
}

fn slugify(title: &str) -> String {
    let lower = title.to_lowercase();
    let slug = SLUG_JUNK.replace_all(&lower, "-");
    let slug: String = slug.trim_matches('-').chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "chat".to_string()
    } else {
        slug.to_string()
    }
}
