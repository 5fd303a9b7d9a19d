//! Client-side cache of conversations and their message lists.
//!
//! Every mutation of message content goes through this store. Callers address messages
//! by [`MessageId`]; the store keeps an index from message to owning conversation so a
//! background exchange keeps writing into its own list after the UI moved elsewhere.

use std::collections::HashMap;

use parley_backend::ConversationId;
use snafu::ensure;

use crate::error::{AlreadyStreamingSnafu, ChatResult, UnknownConversationSnafu};
use crate::message::{CANCELLATION_MARKER, Conversation, Message, MessageId, Role};

/// How a message list came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrigin {
    /// Created locally for a brand-new conversation.
    Created,
    /// Replaced wholesale from persisted history.
    Loaded,
    /// History could not be read; the list only holds the error notice.
    LoadFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageList {
    origin: ListOrigin,
    messages: Vec<Message>,
}

impl MessageList {
    fn new(origin: ListOrigin, messages: Vec<Message>) -> Self {
        Self { origin, messages }
    }

    pub fn origin(&self) -> ListOrigin {
        self.origin
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.streaming)
    }

    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| &message.id == message_id)
    }
}

/// Result of marking a streaming message as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Unknown or already finalized message.
    Ignored,
    /// The message now carries the error text.
    Marked,
    /// The whole first turn of a new conversation was removed.
    Retracted,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    /// Newest first, in the order the backend listed them.
    conversations: Vec<Conversation>,
    lists: HashMap<ConversationId, MessageList>,
    owners: HashMap<MessageId, ConversationId>,
}

impl ConversationStore {
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    /// Replaces the cached listing. Message lists are left untouched.
    pub fn replace_conversations(&mut self, conversations: impl IntoIterator<Item = Conversation>) {
        self.conversations = conversations.into_iter().collect();
    }

    /// Records a conversation this client just created and gives it an empty list.
    pub fn insert_created(&mut self, conversation: Conversation) {
        self.conversations
            .retain(|existing| existing.id != conversation.id);
        self.drop_list(&conversation.id);
        self.lists.insert(
            conversation.id.clone(),
            MessageList::new(ListOrigin::Created, Vec::new()),
        );
        self.conversations.insert(0, conversation);
    }

    /// Inserts unknown conversations at the end; updates the title of known ones.
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|existing| existing.id == conversation.id)
        {
            Some(existing) => {
                if !conversation.title.is_empty() {
                    existing.title = conversation.title;
                }
            }
            None => self.conversations.push(conversation),
        }
    }

    pub fn rename_conversation(&mut self, conversation_id: &ConversationId, title: &str) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| &conversation.id == conversation_id)
        else {
            return false;
        };
        conversation.title = title.to_string();
        true
    }

    /// Forgets the conversation and its messages.
    pub fn remove_conversation(&mut self, conversation_id: &ConversationId) -> bool {
        let before = self.conversations.len();
        self.conversations
            .retain(|conversation| &conversation.id != conversation_id);
        let had_list = self.drop_list(conversation_id);
        had_list || before != self.conversations.len()
    }

    fn drop_list(&mut self, conversation_id: &ConversationId) -> bool {
        let Some(list) = self.lists.remove(conversation_id) else {
            return false;
        };
        for message in &list.messages {
            self.owners.remove(&message.id);
        }
        true
    }

    pub fn list(&self, conversation_id: &ConversationId) -> Option<&MessageList> {
        self.lists.get(conversation_id)
    }

    /// A list that failed to load does not count; the next visit retries.
    pub fn is_populated(&self, conversation_id: &ConversationId) -> bool {
        self.lists
            .get(conversation_id)
            .is_some_and(|list| list.origin != ListOrigin::LoadFailed)
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.lists
            .get(conversation_id)
            .map(MessageList::messages)
            .unwrap_or_default()
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        let conversation_id = self.owners.get(message_id)?;
        let list = self.lists.get(conversation_id)?;
        list.position(message_id).map(|index| &list.messages[index])
    }

    pub fn streaming_message(&self, conversation_id: &ConversationId) -> Option<&Message> {
        self.lists.get(conversation_id)?.streaming_message()
    }

    /// Replaces the list with persisted history.
    ///
    /// Refused while the current list still has a streaming message, since the live
    /// exchange would lose its placeholder.
    pub fn load_history(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) -> bool {
        if self.streaming_message(conversation_id).is_some() {
            tracing::debug!(
                conversation_id = %conversation_id,
                "keeping live message list over fetched history"
            );
            return false;
        }

        self.drop_list(conversation_id);
        for message in &messages {
            self.owners
                .insert(message.id.clone(), conversation_id.clone());
        }
        self.lists.insert(
            conversation_id.clone(),
            MessageList::new(ListOrigin::Loaded, messages),
        );
        true
    }

    /// Stores a single error notice in place of history that could not be read.
    pub fn mark_load_failed(&mut self, conversation_id: &ConversationId, reason: &str) -> bool {
        if self.is_populated(conversation_id) {
            return false;
        }

        self.drop_list(conversation_id);
        let notice = Message::system_error(
            conversation_id.clone(),
            format!("Failed to load conversation: {reason}"),
        );
        self.owners
            .insert(notice.id.clone(), conversation_id.clone());
        self.lists.insert(
            conversation_id.clone(),
            MessageList::new(ListOrigin::LoadFailed, vec![notice]),
        );
        true
    }

    /// Appends a locally created message before the backend confirms anything.
    ///
    /// An assistant message is created as the streaming placeholder; at most one may be
    /// streaming per conversation.
    pub fn append_optimistic(
        &mut self,
        conversation_id: &ConversationId,
        role: Role,
        content: impl Into<String>,
    ) -> ChatResult<Message> {
        let Some(list) = self.lists.get_mut(conversation_id) else {
            return UnknownConversationSnafu {
                stage: "append-optimistic",
                conversation_id: conversation_id.clone(),
            }
            .fail();
        };

        let message = match role {
            Role::User => Message::user(conversation_id.clone(), content),
            Role::Assistant => {
                ensure!(
                    list.streaming_message().is_none(),
                    AlreadyStreamingSnafu {
                        stage: "append-optimistic",
                        conversation_id: conversation_id.clone(),
                    }
                );
                Message::assistant_placeholder(conversation_id.clone(), content)
            }
            Role::SystemError => Message::system_error(conversation_id.clone(), content),
        };

        if list.origin == ListOrigin::LoadFailed {
            list.origin = ListOrigin::Loaded;
        }
        list.messages.push(message.clone());
        self.owners
            .insert(message.id.clone(), conversation_id.clone());
        Ok(message)
    }

    fn streaming_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        let conversation_id = self.owners.get(message_id)?;
        self.lists
            .get_mut(conversation_id)?
            .messages
            .iter_mut()
            .find(|message| &message.id == message_id && message.streaming)
    }

    /// Sets the full accumulated text of a streaming message.
    ///
    /// Content only ever grows while streaming; a shorter text is rejected.
    pub fn apply_chunk(&mut self, message_id: &MessageId, accumulated: &str) -> bool {
        let Some(message) = self.streaming_mut(message_id) else {
            return false;
        };
        if accumulated.len() < message.content.len() {
            tracing::warn!(
                message_id = %message_id,
                current_len = message.content.len(),
                incoming_len = accumulated.len(),
                "rejecting shrinking stream content"
            );
            return false;
        }
        message.content.clear();
        message.content.push_str(accumulated);
        true
    }

    pub fn finalize(&mut self, message_id: &MessageId, final_text: &str) -> bool {
        let Some(message) = self.streaming_mut(message_id) else {
            return false;
        };
        if final_text.len() >= message.content.len() {
            message.content.clear();
            message.content.push_str(final_text);
        }
        message.streaming = false;
        true
    }

    /// Ends a streaming message with an error.
    ///
    /// When the very first turn of a conversation created by this client fails before
    /// any text arrived, both the question and the placeholder are removed.
    pub fn fail(&mut self, message_id: &MessageId, reason: &str) -> FailOutcome {
        let Some(conversation_id) = self.owners.get(message_id) else {
            return FailOutcome::Ignored;
        };
        let Some(list) = self.lists.get_mut(conversation_id) else {
            return FailOutcome::Ignored;
        };
        let Some(index) = list.position(message_id) else {
            return FailOutcome::Ignored;
        };
        if !list.messages[index].streaming {
            return FailOutcome::Ignored;
        }

        let first_turn = list.origin == ListOrigin::Created
            && index == 1
            && list.messages[0].role == Role::User
            && list.messages[index].content.is_empty();
        if first_turn {
            let removed = list.messages.drain(..=index).collect::<Vec<_>>();
            for message in removed {
                self.owners.remove(&message.id);
            }
            return FailOutcome::Retracted;
        }

        let message = &mut list.messages[index];
        if message.content.is_empty() {
            message.content = format!("Error: {reason}");
        } else {
            message.content.push_str(&format!("\n\n[Error: {reason}]"));
        }
        message.streaming = false;
        message.error = true;
        FailOutcome::Marked
    }

    /// Stops a streaming message, keeping the partial text plus the cancellation marker.
    pub fn cancel(&mut self, message_id: &MessageId) -> bool {
        let Some(message) = self.streaming_mut(message_id) else {
            return false;
        };
        message.content.push_str(CANCELLATION_MARKER);
        message.streaming = false;
        true
    }
}
