//! Streaming chat engine.
//!
//! [`SessionCoordinator`] accepts user intents (send, stop, switch), runs one
//! [`StreamSession`] per in-flight answer and applies worker events to the
//! [`ConversationStore`]. Server-push decoding lives in [`decoder`].
mod coordinator;
pub mod decoder;
mod error;
mod events;
mod message;
mod session;
mod store;
#[cfg(test)]
mod testing;

pub use coordinator::{CoordinatorOptions, SendReceipt, SessionCoordinator, SwitchOutcome};
pub use decoder::{COMPLETION_TOKENS, Decoded, StreamEvent, decode, decode_final, decode_stream};
pub use error::{ChatError, ChatResult};
pub use events::{ExchangeChange, ExchangeUpdate, SessionEvent, SessionEventPayload};
pub use message::{
    CANCELLATION_MARKER, Conversation, Message, MessageId, Role, SessionId, StreamTarget,
};
pub use session::{
    SessionState, SessionTransition, SessionTransitionRejection, SessionTransitionResult,
    StreamSession,
};
pub use store::{ConversationStore, FailOutcome, ListOrigin, MessageList};
