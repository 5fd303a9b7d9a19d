//! Terminal front end for a streaming chat backend.
mod command;
mod error;
mod render;
mod repl;
mod settings;

use std::sync::Arc;

use parley_backend::HttpBackend;
use parley_chat::SessionCoordinator;
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

use crate::error::{AppResult, BackendSnafu};
use crate::repl::Repl;
use crate::settings::SettingsStore;

const DEFAULT_LOG_FILTER: &str = "parley=info";

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "parley stopped");
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    // Logs go to stderr so they never interleave with the transcript on stdout.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> AppResult<()> {
    let settings = SettingsStore::load();
    let current = settings.settings();
    tracing::info!(
        api_base_url = %current.api_base_url,
        config_path = %settings.config_path().display(),
        has_token = current.auth_token.is_some(),
        "starting parley"
    );

    let backend = Arc::new(HttpBackend::new(current.to_backend_config()).context(BackendSnafu {
        stage: "build-http-backend",
    })?);
    let coordinator = SessionCoordinator::new(backend.clone(), current.coordinator_options());

    Repl::new(backend, coordinator, settings).run().await
}
