use std::fmt;

use chrono::{DateTime, Utc};
use parley_backend::{
    ConversationId, ConversationRecord, MessageRecord, RemoteMessageId, RemoteRole,
};
use uuid::Uuid;

/// Suffix appended to a placeholder when the user stops generation.
pub const CANCELLATION_MARKER: &str = "\n\n[Response stopped by user]";

/// Identifier for one message.
///
/// Optimistic inserts get a local UUIDv7; messages read back from history carry the
/// server-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(Uuid),
    Remote(RemoteMessageId),
}

impl MessageId {
    pub fn new_local() -> Self {
        Self::Local(Uuid::now_v7())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(raw) => write!(formatter, "local:{raw}"),
            Self::Remote(raw) => write!(formatter, "{raw}"),
        }
    }
}

/// Identifier for one streaming exchange.
///
/// A fresh id is reserved on every send so events of a superseded exchange can never
/// be mistaken for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Where a session writes: the owning conversation and the placeholder it fills.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub assistant_message_id: MessageId,
}

impl StreamTarget {
    pub fn new(conversation_id: ConversationId, assistant_message_id: MessageId) -> Self {
        Self {
            conversation_id,
            assistant_message_id,
        }
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    SystemError,
}

impl From<RemoteRole> for Role {
    fn from(role: RemoteRole) -> Self {
        // Persisted history only distinguishes the asker from everything else.
        match role {
            RemoteRole::User => Self::User,
            RemoteRole::Assistant | RemoteRole::System | RemoteRole::Other => Self::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub streaming: bool,
    pub error: bool,
}

impl Message {
    /// Creates a finalized message authored by the user.
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_local(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            error: false,
        }
    }

    /// Creates the assistant placeholder shown before the first chunk arrives.
    pub fn assistant_placeholder(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_local(),
            conversation_id,
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            streaming: true,
            error: false,
        }
    }

    pub fn system_error(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_local(),
            conversation_id,
            role: Role::SystemError,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            error: true,
        }
    }

    pub fn from_record(conversation_id: ConversationId, record: MessageRecord) -> Self {
        Self {
            id: MessageId::Remote(record.id),
            conversation_id,
            role: Role::from(record.role),
            content: record.content,
            created_at: record.created_at.unwrap_or_else(Utc::now),
            streaming: false,
            error: false,
        }
    }
}

/// Cached copy of a backend-owned conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            created_at: record.created_at.unwrap_or_else(Utc::now),
        }
    }
}
