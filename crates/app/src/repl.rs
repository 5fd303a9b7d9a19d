use std::sync::Arc;

use futures::StreamExt;
use parley_backend::{BackendError, ChatBackend, ConversationId, HttpBackend, StreamRequest};
use parley_chat::{
    CANCELLATION_MARKER, ChatError, ExchangeChange, ExchangeUpdate, SessionCoordinator,
    SessionEvent, StreamEvent, SwitchOutcome, decode_stream,
};
use snafu::{OptionExt, ResultExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

use crate::command::{Command, HELP};
use crate::error::{AppResult, NoSelectionSnafu, SettingsSnafu, TerminalSnafu};
use crate::render::TranscriptRenderer;
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Repl {
    backend: Arc<HttpBackend>,
    coordinator: SessionCoordinator,
    settings: SettingsStore,
    renderer: TranscriptRenderer,
    out: Stdout,
}

impl Repl {
    pub fn new(
        backend: Arc<HttpBackend>,
        coordinator: SessionCoordinator,
        settings: SettingsStore,
    ) -> Self {
        Self {
            backend,
            coordinator,
            settings,
            renderer: TranscriptRenderer::default(),
            out: tokio::io::stdout(),
        }
    }

    pub async fn run(mut self) -> AppResult<()> {
        self.print("parley: type /help for commands\n").await?;
        if let Err(error) = self.coordinator.refresh_conversations(None).await {
            self.report_chat(&error).await?;
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let flow = tokio::select! {
                line = lines.next_line() => {
                    match line.context(TerminalSnafu { stage: "read-stdin" })? {
                        Some(line) => self.handle_line(&line).await?,
                        None => Flow::Quit,
                    }
                }
                Some(event) = self.coordinator.next_event() => {
                    self.apply_event(event).await?;
                    Flow::Continue
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context(TerminalSnafu { stage: "listen-ctrl-c" })?;
                    self.interrupt().await?
                }
            };

            if flow == Flow::Quit {
                break;
            }
        }

        tracing::info!(live_sessions = self.coordinator.live_session_count(), "leaving chat");
        Ok(())
    }

    async fn print(&mut self, text: &str) -> AppResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.out
            .write_all(text.as_bytes())
            .await
            .context(TerminalSnafu {
                stage: "write-stdout",
            })?;
        self.out.flush().await.context(TerminalSnafu {
            stage: "flush-stdout",
        })
    }

    async fn report(&mut self, error: &dyn std::error::Error) -> AppResult<()> {
        self.print(&format!("error: {error}\n")).await
    }

    async fn report_chat(&mut self, error: &ChatError) -> AppResult<()> {
        if let ChatError::Backend {
            source: BackendError::Unauthorized { .. },
            ..
        } = error
        {
            self.sync_cleared_token().await?;
        }
        self.report(error).await
    }

    /// Persists a token the backend dropped after a 401.
    async fn sync_cleared_token(&mut self) -> AppResult<()> {
        let settings = self.settings.settings();
        if settings.auth_token.is_none() || self.backend.config().auth_token.is_some() {
            return Ok(());
        }

        let cleared = settings.as_ref().clone().with_auth_token(None);
        if let Err(error) = self.settings.update(cleared).context(SettingsSnafu {
            stage: "clear-rejected-token",
        }) {
            return self.report(&error).await;
        }
        self.print("The saved API token was rejected and has been cleared; set a new one with /token <value>.\n")
            .await
    }

    async fn interrupt(&mut self) -> AppResult<Flow> {
        match self.coordinator.stop() {
            Some(update) => {
                self.render_update(&update).await?;
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Quit),
        }
    }

    async fn apply_event(&mut self, event: SessionEvent) -> AppResult<()> {
        match self.coordinator.apply_event(event) {
            Some(update) => self.render_update(&update).await,
            None => Ok(()),
        }
    }

    async fn render_update(&mut self, update: &ExchangeUpdate) -> AppResult<()> {
        if !update.bound {
            if matches!(
                update.change,
                ExchangeChange::Completed | ExchangeChange::Failed | ExchangeChange::Retracted
            ) {
                self.renderer.forget(&update.message_id);
                let note = format!("[answer in conversation {} finished]\n", update.conversation_id);
                self.print(&note).await?;
            }
            return Ok(());
        }

        let message = self.coordinator.store().message(&update.message_id).cloned();
        let output = match (&update.change, message) {
            (ExchangeChange::Opened, _) => String::new(),
            (ExchangeChange::ContentGrew, Some(message)) => self.renderer.render_growth(&message),
            (
                ExchangeChange::Completed | ExchangeChange::Failed | ExchangeChange::Cancelled,
                Some(message),
            ) => self.renderer.render_end(&message),
            (ExchangeChange::Retracted, _) => {
                self.renderer.forget(&update.message_id);
                let reason = self.coordinator.last_error().unwrap_or("unknown error");
                format!("\nThe question could not be sent: {reason}\n")
            }
            (_, None) => String::new(),
        };
        self.print(&output).await?;

        if matches!(update.change, ExchangeChange::Failed | ExchangeChange::Retracted) {
            self.sync_cleared_token().await?;
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> AppResult<Flow> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(error) => {
                self.report(&error).await?;
                return Ok(Flow::Continue);
            }
        };

        match command {
            Command::Empty => {}
            Command::Send(query) => self.send(&query).await?,
            Command::New => {
                self.coordinator.clear_selection();
                self.print("Your next message starts a new conversation.\n")
                    .await?;
            }
            Command::List { search } => self.list(search).await?,
            Command::Switch(conversation_id) => {
                let outcome = self
                    .coordinator
                    .switch_conversation(conversation_id)
                    .await;
                if outcome == SwitchOutcome::LoadFailed {
                    self.sync_cleared_token().await?;
                }
                self.show_history().await?;
            }
            Command::Rename(title) => {
                let Some(conversation_id) = self.selected_or_report().await? else {
                    return Ok(Flow::Continue);
                };
                match self
                    .coordinator
                    .rename_conversation(&conversation_id, &title)
                    .await
                {
                    Ok(()) => self.print(&format!("Renamed to \"{title}\".\n")).await?,
                    Err(error) => self.report_chat(&error).await?,
                }
            }
            Command::Delete(target) => {
                let conversation_id = match target {
                    Some(conversation_id) => conversation_id,
                    None => match self.selected_or_report().await? {
                        Some(conversation_id) => conversation_id,
                        None => return Ok(Flow::Continue),
                    },
                };
                match self.coordinator.delete_conversation(&conversation_id).await {
                    Ok(()) => {
                        self.print(&format!("Deleted conversation {conversation_id}.\n"))
                            .await?
                    }
                    Err(error) => self.report_chat(&error).await?,
                }
            }
            Command::Stop => {
                if self.interrupt().await? == Flow::Quit {
                    self.print("Nothing is streaming.\n").await?;
                }
            }
            Command::Ask(query) => self.ask(&query).await?,
            Command::History => self.show_history().await?,
            Command::Token(token) => self.set_token(token).await?,
            Command::Help => self.print(HELP).await?,
            Command::Quit => return Ok(Flow::Quit),
        }

        Ok(Flow::Continue)
    }

    async fn selected_or_report(&mut self) -> AppResult<Option<ConversationId>> {
        let selected = self
            .coordinator
            .selected_conversation()
            .cloned()
            .context(NoSelectionSnafu {
                stage: "resolve-selection",
            });
        match selected {
            Ok(conversation_id) => Ok(Some(conversation_id)),
            Err(error) => {
                self.report(&error).await?;
                Ok(None)
            }
        }
    }

    async fn send(&mut self, query: &str) -> AppResult<()> {
        let target = self.coordinator.selected_conversation().cloned();
        match self.coordinator.send(target, query).await {
            Ok(receipt) => {
                if receipt.created_conversation
                    && let Some(conversation) =
                        self.coordinator.store().conversation(&receipt.conversation_id)
                {
                    let note = format!(
                        "[new conversation {}: {}]\n",
                        conversation.id, conversation.title
                    );
                    self.print(&note).await?;
                }
                Ok(())
            }
            Err(error) => self.report_chat(&error).await,
        }
    }

    async fn list(&mut self, search: Option<String>) -> AppResult<()> {
        if let Err(error) = self.coordinator.refresh_conversations(search).await {
            return self.report_chat(&error).await;
        }

        let selected = self.coordinator.selected_conversation();
        let mut output = String::new();
        for conversation in self.coordinator.store().conversations() {
            let marker = if Some(&conversation.id) == selected {
                '*'
            } else {
                ' '
            };
            output.push_str(&format!(
                "{marker} {:>8}  {}  {}\n",
                conversation.id,
                conversation.created_at.format("%Y-%m-%d %H:%M"),
                conversation.title
            ));
        }
        if output.is_empty() {
            output.push_str("No conversations.\n");
        }
        self.print(&output).await
    }

    async fn show_history(&mut self) -> AppResult<()> {
        let conversation = self
            .coordinator
            .selected_conversation()
            .and_then(|conversation_id| self.coordinator.store().conversation(conversation_id));
        let output = self
            .renderer
            .render_conversation(conversation, self.coordinator.active_messages());
        self.print(&output).await
    }

    async fn set_token(&mut self, token: Option<String>) -> AppResult<()> {
        let next = self
            .settings
            .settings()
            .as_ref()
            .clone()
            .with_auth_token(token);
        self.backend.set_auth_token(next.auth_token.clone());

        let cleared = next.auth_token.is_none();
        if let Err(error) = self.settings.update(next).context(SettingsSnafu {
            stage: "save-auth-token",
        }) {
            return self.report(&error).await;
        }
        let note = if cleared {
            "API token cleared.\n"
        } else {
            "API token saved.\n"
        };
        self.print(note).await
    }

    /// Streams a stateless one-off answer straight to the terminal.
    async fn ask(&mut self, query: &str) -> AppResult<()> {
        let backend = Arc::clone(&self.backend);
        let opened = tokio::select! {
            opened = backend.open_stream(StreamRequest::one_off(query)) => opened,
            _ = tokio::signal::ctrl_c() => {
                return self.print(&format!("{}\n", CANCELLATION_MARKER.trim_start())).await;
            }
        };

        let feed = match opened {
            Ok(feed) => feed,
            Err(error) => {
                let error = ChatError::Backend {
                    stage: "open-one-off-stream",
                    source: error,
                };
                return self.report_chat(&error).await;
            }
        };

        self.print("assistant> ").await?;
        let mut events = decode_stream(feed);
        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(StreamEvent::Chunk(text)) => self.print(&text).await?,
                    Some(StreamEvent::Completed) | None => {
                        self.print("\n").await?;
                        break;
                    }
                    Some(StreamEvent::Error(reason)) => {
                        self.print(&format!("\n\n[Error: {reason}]\n")).await?;
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    // Dropping `events` closes the connection.
                    self.print(&format!("{CANCELLATION_MARKER}\n")).await?;
                    break;
                }
            }
        }
        Ok(())
    }
}
