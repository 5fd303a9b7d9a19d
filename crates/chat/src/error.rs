use parley_backend::{BackendError, ConversationId};
use snafu::Snafu;

use super::message::SessionId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("refusing to send an empty query"))]
    EmptyQuery { stage: &'static str },
    #[snafu(display("conversation '{conversation_id}' has no local message list"))]
    UnknownConversation {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("conversation '{conversation_id}' already has a streaming message"))]
    AlreadyStreaming {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("conversation '{conversation_id}' is still answering (session {session_id})"))]
    ConversationBusy {
        stage: &'static str,
        conversation_id: ConversationId,
        session_id: SessionId,
    },
    #[snafu(display("backend call failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
