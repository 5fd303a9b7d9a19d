//! One streaming exchange: a guarded lifecycle plus the worker task feeding it.

use std::sync::Arc;

use futures::StreamExt;
use parley_backend::{ChatBackend, StreamRequest};
use tokio::sync::{mpsc, oneshot};

use crate::decoder::{StreamEvent, decode_stream};
use crate::events::{SessionEvent, SessionEventPayload};
use crate::message::{SessionId, StreamTarget};

/// Lifecycle tag of a session. `Completed`, `Cancelled` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Opening,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// Transition input for the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    Open,
    Chunk,
    Complete,
    Fail,
    Cancel,
}

/// Rejection reason for illegal session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransitionRejection {
    Terminal(SessionState),
    NotOpened,
    AlreadyOpened,
}

pub type SessionTransitionResult = Result<SessionState, SessionTransitionRejection>;

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Applies one transition deterministically.
    ///
    /// Failure and cancellation are legal from both live states; completion and chunks
    /// require an accepted handshake.
    pub fn apply(self, transition: SessionTransition) -> SessionTransitionResult {
        match (self, transition) {
            (Self::Completed | Self::Cancelled | Self::Failed, _) => {
                Err(SessionTransitionRejection::Terminal(self))
            }
            (Self::Opening, SessionTransition::Open) => Ok(Self::Streaming),
            (Self::Streaming, SessionTransition::Open) => {
                Err(SessionTransitionRejection::AlreadyOpened)
            }
            (Self::Opening, SessionTransition::Chunk | SessionTransition::Complete) => {
                Err(SessionTransitionRejection::NotOpened)
            }
            (Self::Streaming, SessionTransition::Chunk) => Ok(Self::Streaming),
            (Self::Streaming, SessionTransition::Complete) => Ok(Self::Completed),
            (Self::Opening | Self::Streaming, SessionTransition::Fail) => Ok(Self::Failed),
            (Self::Opening | Self::Streaming, SessionTransition::Cancel) => Ok(Self::Cancelled),
        }
    }
}

/// Client side of one exchange.
///
/// Owns the accumulated text and the cancellation handle. Every callback goes through
/// [`SessionState::apply`], so once a terminal state is reached nothing else takes effect.
#[derive(Debug)]
pub struct StreamSession {
    id: SessionId,
    target: StreamTarget,
    state: SessionState,
    buffer: String,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl StreamSession {
    /// Spawns the worker for `query` against an existing conversation.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        backend: Arc<dyn ChatBackend>,
        id: SessionId,
        target: StreamTarget,
        query: impl Into<String>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let request = StreamRequest::chat(target.conversation_id.clone(), query);

        tracing::debug!(
            session_id = %id,
            conversation_id = %target.conversation_id,
            message_id = %target.assistant_message_id,
            backend = backend.id(),
            "opening stream session"
        );
        tokio::spawn(run_stream_worker(backend, request, id, events, cancel_rx));

        Self::with_cancel(id, target, Some(cancel_tx))
    }

    fn with_cancel(
        id: SessionId,
        target: StreamTarget,
        cancel_tx: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            id,
            target,
            state: SessionState::Opening,
            buffer: String::new(),
            cancel_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Full text received so far.
    pub fn accumulated(&self) -> &str {
        &self.buffer
    }

    fn advance(&mut self, transition: SessionTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                self.state = next;
                true
            }
            Err(rejection) => {
                tracing::debug!(
                    session_id = %self.id,
                    ?transition,
                    ?rejection,
                    "dropping session callback"
                );
                false
            }
        }
    }

    pub fn on_opened(&mut self) -> bool {
        self.advance(SessionTransition::Open)
    }

    /// Appends `text` and returns the whole accumulated buffer.
    pub fn on_chunk(&mut self, text: &str) -> Option<&str> {
        if !self.advance(SessionTransition::Chunk) {
            return None;
        }
        self.buffer.push_str(text);
        Some(&self.buffer)
    }

    /// Returns the final text when the completion is accepted.
    pub fn on_completed(&mut self) -> Option<&str> {
        if !self.advance(SessionTransition::Complete) {
            return None;
        }
        tracing::debug!(session_id = %self.id, text_len = self.buffer.len(), "stream session completed");
        Some(&self.buffer)
    }

    pub fn on_failed(&mut self, reason: &str) -> bool {
        if !self.advance(SessionTransition::Fail) {
            return false;
        }
        tracing::warn!(
            session_id = %self.id,
            conversation_id = %self.target.conversation_id,
            received_len = self.buffer.len(),
            reason,
            "stream session failed"
        );
        true
    }

    /// Idempotent. Returns `true` only for the call that moved the session to `Cancelled`.
    pub fn cancel(&mut self) -> bool {
        if !self.advance(SessionTransition::Cancel) {
            return false;
        }
        tracing::debug!(session_id = %self.id, "stream session cancelled");
        self.release_transport();
        true
    }

    fn release_transport(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.release_transport();
    }
}

async fn run_stream_worker(
    backend: Arc<dyn ChatBackend>,
    request: StreamRequest,
    session_id: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let emit = |payload: SessionEventPayload| {
        events
            .send(SessionEvent::new(session_id, payload))
            .is_ok()
    };

    // A dropped sender counts as cancellation: the owning session is gone.
    let opened = tokio::select! {
        biased;
        _ = &mut cancel_rx => {
            tracing::debug!(session_id = %session_id, "stream cancelled before the handshake finished");
            return;
        }
        opened = backend.open_stream(request) => opened,
    };

    let feed = match opened {
        Ok(feed) => feed,
        Err(error) => {
            tracing::error!(session_id = %session_id, error = %error, "failed to open stream");
            emit(SessionEventPayload::Failed(error.to_string()));
            return;
        }
    };

    if !emit(SessionEventPayload::Opened) {
        return;
    }

    let mut decoded = decode_stream(feed);
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                // Dropping `decoded` drops the feed, which closes the connection.
                tracing::debug!(session_id = %session_id, "closing cancelled stream");
                return;
            }
            next = decoded.next() => {
                let payload = match next {
                    Some(StreamEvent::Chunk(text)) => SessionEventPayload::Chunk(text),
                    // A clean close without a completion record still ends the answer.
                    Some(StreamEvent::Completed) | None => SessionEventPayload::Completed,
                    Some(StreamEvent::Error(reason)) => SessionEventPayload::Failed(reason),
                };
                let terminal = !matches!(payload, SessionEventPayload::Chunk(_));
                if !emit(payload) || terminal {
                    return;
                }
            }
        }
    }
}
