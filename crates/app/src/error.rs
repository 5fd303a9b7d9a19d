use parley_backend::BackendError;
use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to set up the backend on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("failed to save settings on `{stage}`, {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("terminal i/o failed on `{stage}`, {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// Input the command parser could not turn into a [`crate::command::Command`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("invalid conversation id, {source}"))]
    InvalidConversation {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("no conversation selected; use /switch <id> or send a message first"))]
    NoSelection { stage: &'static str },
}
