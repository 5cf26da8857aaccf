//! Sessions and conversations.
//!
//! A session is identified by `(launcher_type, launcher_id)` and shared
//! across queries with the same launcher. Its conversation is allocated
//! lazily on first use and cleared by the "new conversation" verb; the
//! per-session mutex serializes stages that touch session state across
//! concurrently running queries.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use relaybot_types::event::LauncherType;
use relaybot_types::provider::ProviderMessage;

/// An ordered message history with a stable id.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub uuid: String,
    pub messages: Vec<ProviderMessage>,
}

impl Conversation {
    fn new() -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }
}

/// One launcher's session.
pub struct Session {
    pub launcher_type: LauncherType,
    pub launcher_id: String,
    /// Current conversation; `None` means a new one is allocated on next
    /// use.
    pub using_conversation: Mutex<Option<Conversation>>,
    /// Serializes session-touching stages across queries.
    pub lock: Mutex<()>,
}

impl Session {
    fn new(launcher_type: LauncherType, launcher_id: String) -> Self {
        Self {
            launcher_type,
            launcher_id,
            using_conversation: Mutex::new(None),
            lock: Mutex::new(()),
        }
    }

    /// The current conversation, allocating one if absent. Returns
    /// `(uuid, messages snapshot)`.
    pub async fn conversation_snapshot(&self) -> (String, Vec<ProviderMessage>) {
        let mut guard = self.using_conversation.lock().await;
        let conversation = guard.get_or_insert_with(Conversation::new);
        (conversation.uuid.clone(), conversation.messages.clone())
    }

    /// Append exchanged messages to the current conversation.
    pub async fn append_messages(&self, messages: &[ProviderMessage]) {
        let mut guard = self.using_conversation.lock().await;
        let conversation = guard.get_or_insert_with(Conversation::new);
        conversation.messages.extend_from_slice(messages);
    }

    /// Drop the current conversation; the next use allocates a fresh one.
    pub async fn new_conversation(&self) {
        *self.using_conversation.lock().await = None;
    }
}

/// Registry of sessions keyed by launcher.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<(LauncherType, String), Arc<Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session for a launcher.
    pub fn get_session(&self, launcher_type: LauncherType, launcher_id: &str) -> Arc<Session> {
        self.sessions
            .entry((launcher_type, launcher_id.to_string()))
            .or_insert_with(|| {
                Arc::new(Session::new(launcher_type, launcher_id.to_string()))
            })
            .clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_launcher_shares_session() {
        let manager = SessionManager::new();
        let a = manager.get_session(LauncherType::Person, "42");
        let b = manager.get_session(LauncherType::Person, "42");
        assert!(Arc::ptr_eq(&a, &b));
        // Different launcher type is a different session.
        let c = manager.get_session(LauncherType::Group, "42");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.session_count(), 2);
    }

    #[tokio::test]
    async fn conversation_allocated_lazily_and_persists() {
        let manager = SessionManager::new();
        let session = manager.get_session(LauncherType::Person, "42");

        let (uuid1, messages) = session.conversation_snapshot().await;
        assert!(messages.is_empty());

        session
            .append_messages(&[ProviderMessage::user("hi"), ProviderMessage::assistant("hello")])
            .await;

        let (uuid2, messages) = session.conversation_snapshot().await;
        assert_eq!(uuid1, uuid2);
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn new_conversation_resets_history() {
        let manager = SessionManager::new();
        let session = manager.get_session(LauncherType::Person, "42");

        let (old_uuid, _) = session.conversation_snapshot().await;
        session.append_messages(&[ProviderMessage::user("hi")]).await;
        session.new_conversation().await;

        let (new_uuid, messages) = session.conversation_snapshot().await;
        assert_ne!(old_uuid, new_uuid);
        assert!(messages.is_empty());
    }
}
