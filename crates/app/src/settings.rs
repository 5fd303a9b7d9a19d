use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_backend::{
    BackendConfig, DEFAULT_API_BASE_URL, DEFAULT_CONVERSATION_PAGE_LIMIT,
    DEFAULT_HISTORY_PAGE_LIMIT, DEFAULT_REQUEST_TIMEOUT_MS,
};
use parley_chat::CoordinatorOptions;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_ms: u64,
    pub history_page_limit: u32,
    pub conversation_page_limit: u32,
    pub enable_api_logging: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_token: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            history_page_limit: DEFAULT_HISTORY_PAGE_LIMIT,
            conversation_page_limit: DEFAULT_CONVERSATION_PAGE_LIMIT,
            enable_api_logging: false,
        }
    }
}

impl ClientSettings {
    pub fn normalized(mut self) -> Self {
        let api_base_url = self.api_base_url.trim().trim_end_matches('/');
        self.api_base_url = if api_base_url.is_empty() {
            DEFAULT_API_BASE_URL.to_string()
        } else {
            api_base_url.to_string()
        };
        self.auth_token = self
            .auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        // Zero would disable paging or time out every call; treat it as unset.
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = DEFAULT_REQUEST_TIMEOUT_MS;
        }
        if self.history_page_limit == 0 {
            self.history_page_limit = DEFAULT_HISTORY_PAGE_LIMIT;
        }
        if self.conversation_page_limit == 0 {
            self.conversation_page_limit = DEFAULT_CONVERSATION_PAGE_LIMIT;
        }

        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self.normalized()
    }

    pub fn to_backend_config(&self) -> BackendConfig {
        BackendConfig::new(self.api_base_url.clone())
            .with_auth_token(self.auth_token.clone())
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_request_logging(self.enable_api_logging)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            history_page_limit: self.history_page_limit,
            conversation_page_limit: self.conversation_page_limit,
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ClientSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ClientSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }

        // A missing file is an empty layer; the environment still applies on top.
        let figment = Figment::from(Serialized::defaults(ClientSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ClientSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ClientSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
