//! Plain-text transcript output.
//!
//! Streaming content only ever grows, so the renderer remembers how many bytes of each
//! message it already printed and emits just the new suffix.

use std::collections::HashMap;
use std::fmt::Write as _;

use parley_chat::{Conversation, Message, MessageId, Role};

#[derive(Debug, Default)]
pub struct TranscriptRenderer {
    printed: HashMap<MessageId, usize>,
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::SystemError => "system",
    }
}

impl TranscriptRenderer {
    /// Renders a whole conversation and forgets any partially printed message.
    pub fn render_conversation(
        &mut self,
        conversation: Option<&Conversation>,
        messages: &[Message],
    ) -> String {
        self.printed.clear();
        let mut output = String::new();

        if let Some(conversation) = conversation {
            let _ = writeln!(output, "== {} [{}] ==", conversation.title, conversation.id);
        }
        if messages.is_empty() {
            output.push_str("(no messages yet)\n");
        }
        for message in messages {
            let _ = writeln!(output, "{}> {}", label(message.role), message.content);
            if message.streaming {
                self.printed
                    .insert(message.id.clone(), message.content.len());
            }
        }
        output
    }

    /// Renders what was appended to `message` since the last call.
    pub fn render_growth(&mut self, message: &Message) -> String {
        let mut output = String::new();
        let printed = match self.printed.get(&message.id) {
            Some(printed) => *printed,
            None => {
                let _ = write!(output, "{}> ", label(message.role));
                0
            }
        };

        match message.content.get(printed..) {
            Some(suffix) => output.push_str(suffix),
            None => {
                // Content was rewritten rather than extended; start over on a new line.
                let _ = write!(output, "\n{}> {}", label(message.role), message.content);
            }
        }
        self.printed
            .insert(message.id.clone(), message.content.len());
        output
    }

    /// Renders the tail of a message that stopped streaming and ends the line.
    pub fn render_end(&mut self, message: &Message) -> String {
        let mut output = self.render_growth(message);
        output.push('\n');
        self.printed.remove(&message.id);
        output
    }

    pub fn forget(&mut self, message_id: &MessageId) {
        self.printed.remove(message_id);
    }
}
