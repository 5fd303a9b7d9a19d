use parley_backend::ConversationId;

use crate::message::{MessageId, SessionId};

/// Worker-to-coordinator payload for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventPayload {
    /// The server accepted the exchange.
    Opened,
    Chunk(String),
    Completed,
    Failed(String),
}

/// Emitted by a stream worker; applied on the control task through [`crate::SessionCoordinator::apply_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub payload: SessionEventPayload,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, payload: SessionEventPayload) -> Self {
        Self {
            session_id,
            payload,
        }
    }
}

/// What changed in the store after an event or intent was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeChange {
    Opened,
    ContentGrew,
    Completed,
    Failed,
    /// The failed first turn was removed from its conversation.
    Retracted,
    Cancelled,
}

/// Store mutation report used by front ends to redraw only what moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeUpdate {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub change: ExchangeChange,
    /// Whether the session is the one currently bound to the UI.
    pub bound: bool,
}
