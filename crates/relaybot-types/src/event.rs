//! Platform events delivered by adapters.
//!
//! An [`Event`] is the canonical form of "a message arrived": either a
//! private message from a [`Friend`] or a group message from a
//! [`GroupMember`]. The original platform payload travels along as an
//! opaque `source_payload` so the adapter can reconstruct reply context
//! on the way back out.

use serde::{Deserialize, Serialize};

use crate::message::MessageChain;

/// Who launched a query: a private chat or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherType {
    Person,
    Group,
}

impl LauncherType {
    /// The string used in access-control specs (`person_*` / `group_*`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Group => "group",
        }
    }
}

impl std::fmt::Display for LauncherType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A private-chat contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Friend {
    pub id: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

/// A group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

/// A group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: String,
    pub nickname: String,
    pub group: Group,
}

/// A canonical inbound message event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    FriendMessage {
        sender: Friend,
        message_chain: MessageChain,
        /// Unix timestamp (seconds).
        time: i64,
        /// Opaque platform payload retained for reply-context reconstruction.
        #[serde(default)]
        source_payload: serde_json::Value,
    },
    GroupMessage {
        sender: GroupMember,
        message_chain: MessageChain,
        time: i64,
        #[serde(default)]
        source_payload: serde_json::Value,
    },
}

impl Event {
    pub fn message_chain(&self) -> &MessageChain {
        match self {
            Self::FriendMessage { message_chain, .. } => message_chain,
            Self::GroupMessage { message_chain, .. } => message_chain,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Self::FriendMessage { sender, .. } => &sender.id,
            Self::GroupMessage { sender, .. } => &sender.id,
        }
    }

    /// The sender's display name; empty when the platform gave none.
    pub fn sender_name(&self) -> &str {
        match self {
            Self::FriendMessage { sender, .. } => &sender.nickname,
            Self::GroupMessage { sender, .. } => &sender.nickname,
        }
    }

    pub fn time(&self) -> i64 {
        match self {
            Self::FriendMessage { time, .. } => *time,
            Self::GroupMessage { time, .. } => *time,
        }
    }

    pub fn source_payload(&self) -> &serde_json::Value {
        match self {
            Self::FriendMessage { source_payload, .. } => source_payload,
            Self::GroupMessage { source_payload, .. } => source_payload,
        }
    }

    /// The `(launcher_type, launcher_id)` pair identifying the session.
    ///
    /// For friend messages the launcher is the sender; for group messages
    /// it is the group.
    pub fn launcher(&self) -> (LauncherType, &str) {
        match self {
            Self::FriendMessage { sender, .. } => (LauncherType::Person, sender.id.as_str()),
            Self::GroupMessage { sender, .. } => (LauncherType::Group, sender.group.id.as_str()),
        }
    }
}
