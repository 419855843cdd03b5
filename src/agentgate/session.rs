//! Per-session conversation persistence.
//!
//! Each session key maps to one JSON file holding a bounded, ordered list
//! of `{role, content}` pairs. Writes replace the whole file via a temp
//! file and an atomic rename, so concurrent writers resolve to
//! last-writer-wins; the request surface serializes writes within a single
//! session key, which is the only ordering callers may rely on. The most
//! recent pairs are attached as context when calling an agent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::agentgate::clients::{Message, Role};
use crate::agentgate::error::GatewayError;

/// How many stored messages are attached as context per call.
pub const CONTEXT_MESSAGES: usize = 10;

/// Default cap on stored messages per session. Oldest entries are trimmed.
pub const MAX_STORED_MESSAGES: usize = 100;

/// One persisted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    /// `"user"`, `"assistant"`, or `"system"`.
    pub role: String,
    /// The message body.
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    session_key: String,
    messages: Vec<StoredMessage>,
}

/// Derive a filesystem-safe filename for a session key.
///
/// Format: `{safe_key}-{sha256(key)[..16]}.json`. The fingerprint keeps
/// keys that sanitize to the same string from colliding.
fn session_filename(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        })
        .take(48)
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut fingerprint = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        fingerprint.push_str(&format!("{:02x}", byte));
    }
    format!("{}-{}.json", safe, fingerprint)
}

/// Whole-file JSON session store.
pub struct SessionStore {
    dir: PathBuf,
    max_messages: usize,
}

impl SessionStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            GatewayError::internal(format!("cannot create session directory: {}", e))
        })?;
        Ok(Self {
            dir,
            max_messages: MAX_STORED_MESSAGES,
        })
    }

    /// Override the stored-message cap (builder pattern).
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(session_filename(key))
    }

    /// Load a session's full stored history. A missing file is an empty
    /// session; a corrupt file is treated as empty and logged.
    pub fn load(&self, key: &str) -> Vec<StoredMessage> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<SessionFile>(&raw) {
            Ok(file) => file.messages,
            Err(e) => {
                log::warn!("session file {:?} unreadable, starting fresh: {}", path, e);
                Vec::new()
            }
        }
    }

    /// Append a user/assistant exchange and persist the trimmed history.
    pub fn append_exchange(
        &self,
        key: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<(), GatewayError> {
        let mut messages = self.load(key);
        messages.push(StoredMessage {
            role: "user".to_string(),
            content: user_content.to_string(),
        });
        messages.push(StoredMessage {
            role: "assistant".to_string(),
            content: assistant_content.to_string(),
        });
        if messages.len() > self.max_messages {
            let excess = messages.len() - self.max_messages;
            messages.drain(..excess);
        }
        self.write(key, &messages)
    }

    /// Replace a session's history wholesale.
    pub fn write(&self, key: &str, messages: &[StoredMessage]) -> Result<(), GatewayError> {
        let file = SessionFile {
            session_key: key.to_string(),
            messages: messages.to_vec(),
        };
        let payload = serde_json::to_string_pretty(&file)
            .map_err(|e| GatewayError::internal(format!("cannot serialize session: {}", e)))?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload.as_bytes())
            .map_err(|e| GatewayError::internal(format!("cannot write session file: {}", e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| GatewayError::internal(format!("cannot replace session file: {}", e)))?;
        Ok(())
    }

    /// The last [`CONTEXT_MESSAGES`] stored messages as provider messages,
    /// ready to prepend to a dispatch.
    pub fn context(&self, key: &str) -> Vec<Message> {
        let messages = self.load(key);
        let start = messages.len().saturating_sub(CONTEXT_MESSAGES);
        messages[start..]
            .iter()
            .map(|stored| {
                let role = match stored.role.as_str() {
                    "assistant" => Role::Assistant,
                    "system" => Role::System,
                    _ => Role::User,
                };
                Message {
                    role,
                    content: std::sync::Arc::from(stored.content.as_str()),
                }
            })
            .collect()
    }

    /// Delete a session file, if present.
    pub fn remove(&self, key: &str) -> Result<(), GatewayError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::internal(format!(
                "cannot remove session file: {}",
                e
            ))),
        }
    }

    /// Directory this store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_safe_and_collision_resistant() {
        let a = session_filename("user/1 chat");
        let b = session_filename("user_1 chat");
        assert!(a.starts_with("user_1_chat-"));
        assert_ne!(a, b, "different keys must map to different files");
    }

    #[test]
    fn context_returns_the_most_recent_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        for i in 0..12 {
            store
                .append_exchange("s1", &format!("q{}", i), &format!("a{}", i))
                .unwrap();
        }
        let context = store.context("s1");
        assert_eq!(context.len(), CONTEXT_MESSAGES);
        // The tail of the stored history: q7..a11.
        assert_eq!(context.last().unwrap().content.as_ref(), "a11");
        assert_eq!(context.first().unwrap().content.as_ref(), "q7");
    }

    #[test]
    fn history_is_trimmed_to_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap().with_max_messages(6);
        for i in 0..10 {
            store
                .append_exchange("s", &format!("q{}", i), &format!("a{}", i))
                .unwrap();
        }
        let messages = store.load("s");
        assert_eq!(messages.len(), 6);
        assert_eq!(messages[0].content, "q7");
    }

    #[test]
    fn corrupt_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        store.append_exchange("s", "hi", "hello").unwrap();
        let path = dir.path().join(session_filename("s"));
        fs::write(&path, b"{not json").unwrap();
        assert!(store.load("s").is_empty());
    }

    #[test]
    fn writes_are_whole_file_replacements() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        store.append_exchange("s", "first", "reply").unwrap();
        store
            .write(
                "s",
                &[StoredMessage {
                    role: "user".to_string(),
                    content: "only".to_string(),
                }],
            )
            .unwrap();
        let messages = store.load("s");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "only");
        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
