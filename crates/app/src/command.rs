use parley_backend::ConversationId;
use snafu::{OptionExt, ResultExt};

use crate::error::{
    CommandError, InvalidConversationSnafu, MissingArgumentSnafu, UnknownCommandSnafu,
};

pub const HELP: &str = "\
Type a message to send it to the selected conversation (a new one is created when none is selected).

  /new               start a new conversation with the next message
  /list [search]     list conversations, optionally filtered by title
  /switch <id>       select a conversation and show its history
  /rename <title>    rename the selected conversation
  /delete [id]       delete a conversation (default: the selected one)
  /stop              stop the answer being streamed (Ctrl-C works too)
  /ask <query>       one-off question outside any conversation
  /history           show the selected conversation again
  /token [value]     set the API token, or clear it when no value is given
  /help              show this help
  /quit              exit
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Send(String),
    New,
    List { search: Option<String> },
    Switch(ConversationId),
    Rename(String),
    Delete(Option<ConversationId>),
    Stop,
    Ask(String),
    History,
    Token(Option<String>),
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, Some(argument.trim()).filter(|arg| !arg.is_empty())),
            None => (rest, None),
        };

        let command = match name {
            "new" => Self::New,
            "list" | "ls" => Self::List {
                search: argument.map(str::to_string),
            },
            "switch" | "open" => {
                let raw = argument.context(MissingArgumentSnafu {
                    stage: "parse-switch",
                    command: "switch",
                    argument: "a conversation id",
                })?;
                Self::Switch(parse_conversation_id(raw, "parse-switch")?)
            }
            "rename" => {
                let title = argument.context(MissingArgumentSnafu {
                    stage: "parse-rename",
                    command: "rename",
                    argument: "a title",
                })?;
                Self::Rename(title.to_string())
            }
            "delete" | "rm" => Self::Delete(
                argument
                    .map(|raw| parse_conversation_id(raw, "parse-delete"))
                    .transpose()?,
            ),
            "stop" => Self::Stop,
            "ask" => {
                let query = argument.context(MissingArgumentSnafu {
                    stage: "parse-ask",
                    command: "ask",
                    argument: "a question",
                })?;
                Self::Ask(query.to_string())
            }
            "history" => Self::History,
            "token" => Self::Token(argument.map(str::to_string)),
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => {
                return UnknownCommandSnafu {
                    stage: "parse-command",
                    name: other.to_string(),
                }
                .fail();
            }
        };

        Ok(command)
    }
}

fn parse_conversation_id(raw: &str, stage: &'static str) -> Result<ConversationId, CommandError> {
    ConversationId::parse(raw).context(InvalidConversationSnafu { stage })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn id(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    #[test]
    fn plain_text_is_sent_verbatim_after_trimming() {
        assert_eq!(Command::parse("   ").unwrap(), Command::Empty);
        assert_eq!(
            Command::parse("  what is a borrow?  ").unwrap(),
            Command::Send("what is a borrow?".to_string())
        );
    }

    #[test]
    fn commands_take_optional_and_required_arguments() {
        assert_eq!(Command::parse("/list").unwrap(), Command::List { search: None });
        assert_eq!(
            Command::parse("/list   rust  ").unwrap(),
            Command::List {
                search: Some("rust".to_string())
            }
        );
        assert_eq!(Command::parse("/switch 42").unwrap(), Command::Switch(id("42")));
        assert_eq!(Command::parse("/delete").unwrap(), Command::Delete(None));
        assert_eq!(Command::parse("/rm 7").unwrap(), Command::Delete(Some(id("7"))));
        assert_eq!(
            Command::parse("/rename Weekend plans").unwrap(),
            Command::Rename("Weekend plans".to_string())
        );
        assert_eq!(Command::parse("/token").unwrap(), Command::Token(None));
        assert_eq!(
            Command::parse("/token abc").unwrap(),
            Command::Token(Some("abc".to_string()))
        );
        assert_eq!(Command::parse("/q").unwrap(), Command::Quit);
    }

    #[test]
    fn missing_arguments_and_unknown_commands_are_rejected() {
        assert!(matches!(
            Command::parse("/switch"),
            Err(CommandError::MissingArgument {
                command: "switch",
                ..
            })
        ));
        assert!(matches!(
            Command::parse("/ask   "),
            Err(CommandError::MissingArgument { command: "ask", .. })
        ));
        assert!(matches!(
            Command::parse("/frobnicate now"),
            Err(CommandError::UnknownCommand { name, .. }) if name == "frobnicate"
        ));
    }
}
