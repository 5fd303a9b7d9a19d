//! Owns every live exchange and decides which one the UI is bound to.
//!
//! Workers never touch the store. They push [`SessionEvent`]s into one channel; the
//! control task pulls them with [`SessionCoordinator::next_event`] and applies them with
//! [`SessionCoordinator::apply_event`]. An event whose session is no longer registered
//! is dropped, so a stopped or superseded exchange cannot write into the transcript.

use std::collections::HashMap;
use std::sync::Arc;

use parley_backend::{
    ChatBackend, ConversationId, ConversationQuery, DEFAULT_CONVERSATION_PAGE_LIMIT,
    DEFAULT_HISTORY_PAGE_LIMIT, PageRequest,
};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;

use crate::error::{
    AlreadyStreamingSnafu, BackendSnafu, ChatResult, ConversationBusySnafu, EmptyQuerySnafu,
};
use crate::events::{ExchangeChange, ExchangeUpdate, SessionEvent, SessionEventPayload};
use crate::message::{Conversation, Message, MessageId, Role, SessionId, StreamTarget};
use crate::session::StreamSession;
use crate::store::{ConversationStore, FailOutcome};

const MAX_DERIVED_TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub history_page_limit: u32,
    pub conversation_page_limit: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            history_page_limit: DEFAULT_HISTORY_PAGE_LIMIT,
            conversation_page_limit: DEFAULT_CONVERSATION_PAGE_LIMIT,
        }
    }
}

/// Identifiers reserved by a successful [`SessionCoordinator::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    /// The conversation was created for this send.
    pub created_conversation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Already selected.
    Unchanged,
    /// Cached list reused without a history fetch.
    Cached,
    Loaded,
    LoadFailed,
}

pub struct SessionCoordinator {
    backend: Arc<dyn ChatBackend>,
    options: CoordinatorOptions,
    store: ConversationStore,
    sessions: HashMap<SessionId, StreamSession>,
    bound_session: Option<SessionId>,
    selected_conversation: Option<ConversationId>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    next_session_id: u64,
    last_error: Option<String>,
}

impl SessionCoordinator {
    pub fn new(backend: Arc<dyn ChatBackend>, options: CoordinatorOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            options,
            store: ConversationStore::default(),
            sessions: HashMap::new(),
            bound_session: None,
            selected_conversation: None,
            events_tx,
            events_rx,
            next_session_id: 0,
            last_error: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn selected_conversation(&self) -> Option<&ConversationId> {
        self.selected_conversation.as_ref()
    }

    /// Messages of the selected conversation.
    pub fn active_messages(&self) -> &[Message] {
        match &self.selected_conversation {
            Some(conversation_id) => self.store.messages(conversation_id),
            None => &[],
        }
    }

    pub fn bound_session(&self) -> Option<&StreamSession> {
        self.bound_session
            .and_then(|session_id| self.sessions.get(&session_id))
    }

    /// Whether the UI should show the stop control.
    pub fn is_streaming(&self) -> bool {
        self.bound_session().is_some()
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    fn allocate_session_id(&mut self) -> SessionId {
        self.next_session_id += 1;
        SessionId::new(self.next_session_id)
    }

    fn live_session_for(&self, conversation_id: &ConversationId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| &session.target().conversation_id == conversation_id)
            .map(StreamSession::id)
    }

    /// Selects `conversation_id` and rebinds a live exchange that belongs to it.
    fn select(&mut self, conversation_id: ConversationId) {
        self.bound_session = self.live_session_for(&conversation_id);
        if let Some(session_id) = self.bound_session {
            tracing::debug!(
                session_id = %session_id,
                conversation_id = %conversation_id,
                "rebinding live stream session"
            );
        }
        self.selected_conversation = Some(conversation_id);
    }

    /// Deselects the conversation. Live exchanges keep running in the background.
    pub fn clear_selection(&mut self) {
        self.selected_conversation = None;
        self.bound_session = None;
    }

    /// Sends `query`, creating a conversation first when none is given.
    ///
    /// The question and the assistant placeholder are inserted before the worker starts,
    /// and the new session becomes the bound one.
    pub async fn send(
        &mut self,
        conversation_id: Option<ConversationId>,
        query: &str,
    ) -> ChatResult<SendReceipt> {
        ensure!(!query.trim().is_empty(), EmptyQuerySnafu { stage: "send" });

        let (conversation_id, created_conversation) = match conversation_id {
            Some(conversation_id) => {
                if self.selected_conversation.as_ref() != Some(&conversation_id) {
                    self.switch_conversation(conversation_id.clone()).await;
                }
                (conversation_id, false)
            }
            None => (self.create_conversation(query).await?.id, true),
        };

        if let Some(session_id) = self.live_session_for(&conversation_id) {
            return ConversationBusySnafu {
                stage: "send",
                conversation_id,
                session_id,
            }
            .fail();
        }
        ensure!(
            self.store.streaming_message(&conversation_id).is_none(),
            AlreadyStreamingSnafu {
                stage: "send",
                conversation_id: conversation_id.clone(),
            }
        );

        let user = self
            .store
            .append_optimistic(&conversation_id, Role::User, query)?;
        let placeholder = self
            .store
            .append_optimistic(&conversation_id, Role::Assistant, "")?;

        let session_id = self.allocate_session_id();
        let target = StreamTarget::new(conversation_id.clone(), placeholder.id.clone());
        let session = StreamSession::open(
            Arc::clone(&self.backend),
            session_id,
            target,
            query,
            self.events_tx.clone(),
        );
        self.sessions.insert(session_id, session);
        self.bound_session = Some(session_id);
        self.last_error = None;

        tracing::info!(
            session_id = %session_id,
            conversation_id = %conversation_id,
            created_conversation,
            query_len = query.len(),
            "sent chat query"
        );

        Ok(SendReceipt {
            session_id,
            conversation_id,
            user_message_id: user.id,
            assistant_message_id: placeholder.id,
            created_conversation,
        })
    }

    async fn create_conversation(&mut self, first_query: &str) -> ChatResult<Conversation> {
        let record = match self.backend.create_conversation(first_query).await {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(error = %error, "failed to create conversation");
                self.last_error = Some(error.to_string());
                return Err(error).context(BackendSnafu {
                    stage: "create-conversation",
                });
            }
        };

        let mut conversation = Conversation::from(record);
        if conversation.title.trim().is_empty() {
            conversation.title = derive_title(first_query);
        }
        tracing::info!(conversation_id = %conversation.id, "created conversation");

        self.store.insert_created(conversation.clone());
        self.select(conversation.id.clone());
        Ok(conversation)
    }

    /// Stops the bound exchange and keeps its partial text plus the cancellation marker.
    ///
    /// Returns `None` when nothing is bound.
    pub fn stop(&mut self) -> Option<ExchangeUpdate> {
        let session_id = self.bound_session.take()?;
        let mut session = self.sessions.remove(&session_id)?;
        if !session.cancel() {
            return None;
        }

        let target = session.target().clone();
        self.store.cancel(&target.assistant_message_id);
        tracing::info!(
            session_id = %session_id,
            conversation_id = %target.conversation_id,
            "stopped stream session"
        );

        Some(ExchangeUpdate {
            session_id,
            conversation_id: target.conversation_id,
            message_id: target.assistant_message_id,
            change: ExchangeChange::Cancelled,
            bound: true,
        })
    }

    /// Selects another conversation, loading its history on the first visit.
    ///
    /// The previously bound exchange keeps running and keeps writing into its own list.
    pub async fn switch_conversation(&mut self, conversation_id: ConversationId) -> SwitchOutcome {
        if self.selected_conversation.as_ref() == Some(&conversation_id) {
            return SwitchOutcome::Unchanged;
        }

        self.select(conversation_id.clone());
        if self.store.is_populated(&conversation_id) {
            return SwitchOutcome::Cached;
        }
        self.load_history(&conversation_id).await
    }

    async fn load_history(&mut self, conversation_id: &ConversationId) -> SwitchOutcome {
        let page = PageRequest {
            limit: self.options.history_page_limit,
            offset: 0,
        };

        match self.backend.fetch_history(conversation_id, page).await {
            Ok(history) => {
                if !history.conversation_title.is_empty() {
                    self.store.upsert_conversation(Conversation::new(
                        conversation_id.clone(),
                        history.conversation_title,
                    ));
                }
                let messages = history
                    .messages
                    .into_iter()
                    .map(|record| Message::from_record(conversation_id.clone(), record))
                    .collect::<Vec<_>>();
                tracing::debug!(
                    conversation_id = %conversation_id,
                    message_count = messages.len(),
                    "loaded conversation history"
                );
                self.store.load_history(conversation_id, messages);
                SwitchOutcome::Loaded
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to load conversation history"
                );
                let reason = error.to_string();
                self.store.mark_load_failed(conversation_id, &reason);
                self.last_error = Some(reason);
                SwitchOutcome::LoadFailed
            }
        }
    }

    /// Re-reads the conversation listing. Returns the number of conversations listed.
    pub async fn refresh_conversations(&mut self, search: Option<String>) -> ChatResult<usize> {
        let query = ConversationQuery {
            limit: self.options.conversation_page_limit,
            ..ConversationQuery::default()
        }
        .with_search(search);

        let page = match self.backend.list_conversations(query).await {
            Ok(page) => page,
            Err(error) => {
                self.last_error = Some(error.to_string());
                return Err(error).context(BackendSnafu {
                    stage: "list-conversations",
                });
            }
        };

        let count = page.conversations.len();
        self.store
            .replace_conversations(page.conversations.into_iter().map(Conversation::from));
        Ok(count)
    }

    pub async fn rename_conversation(
        &mut self,
        conversation_id: &ConversationId,
        title: &str,
    ) -> ChatResult<()> {
        let record = self
            .backend
            .rename_conversation(conversation_id, title)
            .await
            .context(BackendSnafu {
                stage: "rename-conversation",
            })?;

        let title = if record.title.is_empty() {
            title
        } else {
            record.title.as_str()
        };
        if !self.store.rename_conversation(conversation_id, title) {
            self.store
                .upsert_conversation(Conversation::new(conversation_id.clone(), title));
        }
        Ok(())
    }

    /// Deletes the conversation remotely, cancels its live exchange and forgets it.
    pub async fn delete_conversation(&mut self, conversation_id: &ConversationId) -> ChatResult<()> {
        self.backend
            .delete_conversation(conversation_id)
            .await
            .context(BackendSnafu {
                stage: "delete-conversation",
            })?;

        if let Some(session_id) = self.live_session_for(conversation_id)
            && let Some(mut session) = self.sessions.remove(&session_id)
        {
            session.cancel();
        }
        self.store.remove_conversation(conversation_id);
        if self.selected_conversation.as_ref() == Some(conversation_id) {
            self.clear_selection();
        }
        tracing::info!(conversation_id = %conversation_id, "deleted conversation");
        Ok(())
    }

    /// Waits for the next worker event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Returns a queued worker event without waiting.
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Waits for events until one changes the store.
    pub async fn process_next_event(&mut self) -> Option<ExchangeUpdate> {
        loop {
            let event = self.next_event().await?;
            if let Some(update) = self.apply_event(event) {
                return Some(update);
            }
        }
    }

    /// Applies one worker event. Events of unregistered sessions are dropped.
    pub fn apply_event(&mut self, event: SessionEvent) -> Option<ExchangeUpdate> {
        let session_id = event.session_id;
        let bound = self.bound_session == Some(session_id);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            tracing::trace!(session_id = %session_id, "dropping event of a finished session");
            return None;
        };
        let target = session.target().clone();

        let change = match event.payload {
            SessionEventPayload::Opened => {
                if !session.on_opened() {
                    return None;
                }
                ExchangeChange::Opened
            }
            SessionEventPayload::Chunk(text) => {
                let accumulated = session.on_chunk(&text)?;
                if !self
                    .store
                    .apply_chunk(&target.assistant_message_id, accumulated)
                {
                    return None;
                }
                ExchangeChange::ContentGrew
            }
            SessionEventPayload::Completed => {
                let final_text = session.on_completed()?;
                self.store
                    .finalize(&target.assistant_message_id, final_text);
                self.finish_session(session_id);
                ExchangeChange::Completed
            }
            SessionEventPayload::Failed(reason) => {
                if !session.on_failed(&reason) {
                    return None;
                }
                let outcome = self.store.fail(&target.assistant_message_id, &reason);
                if bound {
                    self.last_error = Some(reason);
                }
                self.finish_session(session_id);
                match outcome {
                    FailOutcome::Retracted => ExchangeChange::Retracted,
                    FailOutcome::Marked | FailOutcome::Ignored => ExchangeChange::Failed,
                }
            }
        };

        Some(ExchangeUpdate {
            session_id,
            conversation_id: target.conversation_id,
            message_id: target.assistant_message_id,
            change,
            bound,
        })
    }

    fn finish_session(&mut self, session_id: SessionId) {
        self.sessions.remove(&session_id);
        if self.bound_session == Some(session_id) {
            self.bound_session = None;
        }
    }
}

fn derive_title(query: &str) -> String {
    let query = query.trim();
    let mut title = query
        .chars()
        .take(MAX_DERIVED_TITLE_CHARS)
        .collect::<String>();
    if query.chars().count() > MAX_DERIVED_TITLE_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_backend::{ConversationRecord, RemoteRole};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ChatError;
    use crate::message::CANCELLATION_MARKER;
    use crate::testing::ScriptedBackend;

    fn conversation_id(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    fn coordinator() -> (Arc<ScriptedBackend>, SessionCoordinator) {
        let backend = Arc::new(ScriptedBackend::default());
        let coordinator = SessionCoordinator::new(backend.clone(), CoordinatorOptions::default());
        (backend, coordinator)
    }

    async fn process(coordinator: &mut SessionCoordinator) -> ExchangeUpdate {
        tokio::time::timeout(Duration::from_secs(1), coordinator.process_next_event())
            .await
            .expect("exchange update")
            .expect("event channel open")
    }

    fn content(coordinator: &SessionCoordinator, message_id: &MessageId) -> String {
        coordinator.store().message(message_id).unwrap().content.clone()
    }

    #[tokio::test]
    async fn new_conversation_streams_to_completion() {
        let (backend, mut coordinator) = coordinator();
        let feed = backend.push_feed();

        let receipt = coordinator.send(None, "Hello").await.unwrap();
        assert!(receipt.created_conversation);
        assert_eq!(coordinator.selected_conversation(), Some(&receipt.conversation_id));
        assert!(coordinator.is_streaming());

        let messages = coordinator.active_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hello");
        assert!(messages[1].streaming);

        assert_eq!(process(&mut coordinator).await.change, ExchangeChange::Opened);
        feed.send_record("Hi");
        feed.send_record("");
        feed.send_record("there");
        feed.send_record("[DONE]");

        for _ in 0..3 {
            assert_eq!(process(&mut coordinator).await.change, ExchangeChange::ContentGrew);
        }
        let update = process(&mut coordinator).await;
        assert_eq!(update.change, ExchangeChange::Completed);
        assert!(update.bound);

        let placeholder = coordinator.store().message(&receipt.assistant_message_id).unwrap();
        assert_eq!(placeholder.content, "Hi\nthere");
        assert!(!placeholder.streaming);
        assert!(!coordinator.is_streaming());
        assert_eq!(coordinator.live_session_count(), 0);
    }

    #[tokio::test]
    async fn stop_keeps_partial_text_and_drops_late_chunks() {
        let (backend, mut coordinator) = coordinator();
        let feed = backend.push_feed();
        let receipt = coordinator.send(None, "Hello").await.unwrap();

        process(&mut coordinator).await;
        feed.send_record("Par");
        feed.send_record("tial");
        process(&mut coordinator).await;
        process(&mut coordinator).await;

        let update = coordinator.stop().unwrap();
        assert_eq!(update.change, ExchangeChange::Cancelled);
        assert!(coordinator.stop().is_none());
        feed.wait_until_released().await;

        let late = SessionEvent::new(receipt.session_id, SessionEventPayload::Chunk("late".to_string()));
        assert_eq!(coordinator.apply_event(late), None);
        let late = SessionEvent::new(receipt.session_id, SessionEventPayload::Completed);
        assert_eq!(coordinator.apply_event(late), None);
        while let Some(event) = coordinator.try_next_event() {
            assert_eq!(coordinator.apply_event(event), None);
        }

        let expected = format!("Partial{CANCELLATION_MARKER}");
        assert_eq!(content(&coordinator, &receipt.assistant_message_id), expected);
        assert!(!coordinator.is_streaming());
    }

    #[tokio::test]
    async fn switching_away_keeps_the_background_exchange_writing() {
        let (backend, mut coordinator) = coordinator();
        backend.set_history("b", "Bee", &[(RemoteRole::User, "old q"), (RemoteRole::Assistant, "old a")]);
        let feed = backend.push_feed();

        let receipt = coordinator.send(None, "Hello").await.unwrap();
        let conversation_a = receipt.conversation_id.clone();
        process(&mut coordinator).await;
        feed.send_record("Hi");
        process(&mut coordinator).await;

        assert_eq!(
            coordinator.switch_conversation(conversation_id("b")).await,
            SwitchOutcome::Loaded
        );
        assert!(!coordinator.is_streaming());
        assert_eq!(coordinator.active_messages().len(), 2);
        assert_eq!(coordinator.active_messages()[1].content, "old a");

        feed.send_record(" there");
        let update = process(&mut coordinator).await;
        assert_eq!(update.change, ExchangeChange::ContentGrew);
        assert!(!update.bound);
        assert_eq!(update.conversation_id, conversation_a);
        assert_eq!(content(&coordinator, &receipt.assistant_message_id), "Hi there");
        assert_eq!(coordinator.active_messages()[1].content, "old a");

        assert_eq!(
            coordinator.switch_conversation(conversation_a.clone()).await,
            SwitchOutcome::Cached
        );
        assert_eq!(
            coordinator.bound_session().map(StreamSession::id),
            Some(receipt.session_id)
        );

        feed.send_record("[DONE]");
        let update = process(&mut coordinator).await;
        assert_eq!(update.change, ExchangeChange::Completed);
        assert!(update.bound);
        assert_eq!(backend.history_calls(), 1);
    }

    #[tokio::test]
    async fn cached_conversations_are_not_refetched() {
        let (backend, mut coordinator) = coordinator();
        backend.set_history("a", "A", &[(RemoteRole::User, "q")]);

        assert_eq!(coordinator.switch_conversation(conversation_id("a")).await, SwitchOutcome::Loaded);
        assert_eq!(coordinator.switch_conversation(conversation_id("a")).await, SwitchOutcome::Unchanged);
        assert_eq!(coordinator.switch_conversation(conversation_id("b")).await, SwitchOutcome::Loaded);
        assert_eq!(coordinator.switch_conversation(conversation_id("a")).await, SwitchOutcome::Cached);
        assert_eq!(backend.history_calls(), 2);
        assert_eq!(coordinator.store().conversation(&conversation_id("a")).unwrap().title, "A");
    }

    #[tokio::test]
    async fn failed_history_load_shows_notice_and_retries() {
        let (backend, mut coordinator) = coordinator();
        backend.fail_history("a", "database offline");

        assert_eq!(
            coordinator.switch_conversation(conversation_id("a")).await,
            SwitchOutcome::LoadFailed
        );
        let notice = &coordinator.active_messages()[0];
        assert_eq!(notice.role, Role::SystemError);
        assert!(notice.content.contains("database offline"));
        assert!(coordinator.last_error().is_some());

        coordinator.clear_selection();
        backend.set_history("a", "A", &[(RemoteRole::User, "q")]);
        assert_eq!(coordinator.switch_conversation(conversation_id("a")).await, SwitchOutcome::Loaded);
        assert_eq!(coordinator.active_messages()[0].content, "q");
        assert_eq!(backend.history_calls(), 2);
    }

    #[tokio::test]
    async fn rejected_first_turn_is_retracted() {
        let (backend, mut coordinator) = coordinator();
        backend.push_rejection(429, "slow down");

        let receipt = coordinator.send(None, "Hello").await.unwrap();
        let update = process(&mut coordinator).await;

        assert_eq!(update.change, ExchangeChange::Retracted);
        assert!(coordinator.active_messages().is_empty());
        assert!(coordinator.last_error().unwrap().contains("slow down"));
        assert!(coordinator.store().conversation(&receipt.conversation_id).is_some());
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_text() {
        let (backend, mut coordinator) = coordinator();
        let feed = backend.push_feed();
        let receipt = coordinator.send(None, "Hello").await.unwrap();

        process(&mut coordinator).await;
        feed.send_record("Par");
        process(&mut coordinator).await;
        feed.fail("connection reset");

        let update = process(&mut coordinator).await;
        assert_eq!(update.change, ExchangeChange::Failed);
        let placeholder = coordinator.store().message(&receipt.assistant_message_id).unwrap();
        assert!(placeholder.error);
        assert!(placeholder.content.starts_with("Par\n\n[Error: "));
        assert!(placeholder.content.contains("connection reset"));
    }

    #[tokio::test]
    async fn clean_close_without_token_completes() {
        let (backend, mut coordinator) = coordinator();
        let feed = backend.push_feed();
        let receipt = coordinator.send(None, "Hello").await.unwrap();

        process(&mut coordinator).await;
        feed.send_raw("data: tail without boundary");
        feed.close();

        assert_eq!(process(&mut coordinator).await.change, ExchangeChange::ContentGrew);
        assert_eq!(process(&mut coordinator).await.change, ExchangeChange::Completed);
        assert_eq!(
            content(&coordinator, &receipt.assistant_message_id),
            "tail without boundary"
        );
    }

    #[tokio::test]
    async fn conversation_creation_failure_reports_and_inserts_nothing() {
        let (backend, mut coordinator) = coordinator();
        backend.fail_next_create("quota exceeded");

        let error = coordinator.send(None, "Hello").await.unwrap_err();
        assert!(matches!(error, ChatError::Backend { .. }));
        assert!(coordinator.last_error().unwrap().contains("quota exceeded"));
        assert!(coordinator.store().conversations().is_empty());
        assert!(coordinator.selected_conversation().is_none());
        assert!(backend.stream_requests().is_empty());
    }

    #[tokio::test]
    async fn empty_and_concurrent_sends_are_rejected() {
        let (backend, mut coordinator) = coordinator();
        let _feed = backend.push_feed();

        let error = coordinator.send(None, "   ").await.unwrap_err();
        assert!(matches!(error, ChatError::EmptyQuery { .. }));

        let receipt = coordinator.send(None, "Hello").await.unwrap();
        let error = coordinator
            .send(Some(receipt.conversation_id.clone()), "Again")
            .await
            .unwrap_err();
        assert!(matches!(error, ChatError::ConversationBusy { .. }));
        assert_eq!(coordinator.active_messages().len(), 2);
    }

    #[tokio::test]
    async fn each_send_gets_a_fresh_session() {
        let (backend, mut coordinator) = coordinator();
        let first_feed = backend.push_feed();
        let second_feed = backend.push_feed();

        let first = coordinator.send(None, "One").await.unwrap();
        process(&mut coordinator).await;
        first_feed.send_record("[DONE]");
        process(&mut coordinator).await;

        let second = coordinator
            .send(Some(first.conversation_id.clone()), "Two")
            .await
            .unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(!second.created_conversation);

        process(&mut coordinator).await;
        second_feed.send_record("ok");
        second_feed.send_record("[DONE]");
        process(&mut coordinator).await;
        process(&mut coordinator).await;

        let contents = coordinator
            .active_messages()
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["One", "", "Two", "ok"]);

        let requests = backend.stream_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].conversation_id.as_ref(), Some(&first.conversation_id));
    }

    #[tokio::test]
    async fn listing_rename_and_delete_update_the_cache() {
        let (backend, mut coordinator) = coordinator();
        backend.set_conversations(vec![
            ConversationRecord {
                id: conversation_id("a"),
                title: "Rust questions".to_string(),
                created_at: None,
            },
            ConversationRecord {
                id: conversation_id("b"),
                title: "Cooking".to_string(),
                created_at: None,
            },
        ]);

        assert_eq!(coordinator.refresh_conversations(None).await.unwrap(), 2);
        assert_eq!(
            coordinator
                .refresh_conversations(Some("Rust".to_string()))
                .await
                .unwrap(),
            1
        );
        coordinator.refresh_conversations(None).await.unwrap();

        coordinator
            .rename_conversation(&conversation_id("b"), "Baking")
            .await
            .unwrap();
        assert_eq!(
            coordinator.store().conversation(&conversation_id("b")).unwrap().title,
            "Baking"
        );

        coordinator.switch_conversation(conversation_id("a")).await;
        coordinator.delete_conversation(&conversation_id("a")).await.unwrap();
        assert!(coordinator.selected_conversation().is_none());
        assert!(coordinator.store().conversation(&conversation_id("a")).is_none());
        assert_eq!(backend.deleted(), vec![conversation_id("a")]);
    }

    #[tokio::test]
    async fn deleting_a_streaming_conversation_cancels_its_exchange() {
        let (backend, mut coordinator) = coordinator();
        let feed = backend.push_feed();
        let receipt = coordinator.send(None, "Hello").await.unwrap();
        process(&mut coordinator).await;

        coordinator
            .delete_conversation(&receipt.conversation_id)
            .await
            .unwrap();

        assert_eq!(coordinator.live_session_count(), 0);
        feed.wait_until_released().await;
    }

    #[test]
    fn derived_titles_are_truncated() {
        assert_eq!(derive_title("  short  "), "short");
        let long = "x".repeat(60);
        assert_eq!(derive_title(&long), format!("{}...", "x".repeat(50)));
    }
}
