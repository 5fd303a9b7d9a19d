//! Transport boundary between the chat engine and the language-model backend.
//!
//! The engine only talks to [`ChatBackend`]; [`HttpBackend`] is the production
//! implementation speaking the REST + server-push contract.
mod backend;
mod http_adapter;
mod ids;
mod model;

pub use backend::{
    BackendConfig, BackendError, BackendResult, BoxFuture, ByteStream, ChatBackend,
    DEFAULT_API_BASE_URL, DEFAULT_REQUEST_TIMEOUT_MS, StreamRequest,
};
pub use http_adapter::{HTTP_BACKEND_ID, HttpBackend};
pub use ids::{ConversationId, RemoteMessageId};
pub use model::{
    ConversationPage, ConversationQuery, ConversationRecord, DEFAULT_CONVERSATION_PAGE_LIMIT,
    DEFAULT_HISTORY_PAGE_LIMIT, HistoryPage, MessageRecord, PageRequest, RemoteRole,
};
