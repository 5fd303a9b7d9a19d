use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use snafu::Snafu;

use super::ids::ConversationId;
use super::model::{ConversationPage, ConversationQuery, ConversationRecord, HistoryPage, PageRequest};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    /// Applies to REST calls only; streams are long-lived and bounded by the connect timeout.
    pub request_timeout: Duration,
    pub log_requests: bool,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim().trim_end_matches('/');

        Self {
            base_url: if base_url.is_empty() {
                DEFAULT_API_BASE_URL.to_string()
            } else {
                base_url.to_string()
            },
            auth_token: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            log_requests: false,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE_URL)
    }
}

/// One streaming exchange. `conversation_id = None` is the stateless one-off query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub conversation_id: Option<ConversationId>,
    pub query: String,
}

impl StreamRequest {
    pub fn chat(conversation_id: ConversationId, query: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            query: query.into(),
        }
    }

    pub fn one_off(query: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            query: query.into(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Raw server-push feed. Dropping it closes the underlying connection.
pub type ByteStream = BoxStream<'static, BackendResult<Bytes>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("{id_type} '{raw}' is not a valid identifier"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("refusing to send an empty query on `{stage}`"))]
    EmptyQuery { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend rejected credentials on `{stage}`: {detail}"))]
    Unauthorized { stage: &'static str, detail: String },
    #[snafu(display("backend returned status {status} on `{stage}`: {detail}"))]
    Status {
        stage: &'static str,
        status: u16,
        detail: String,
    },
    #[snafu(display("failed to decode backend payload on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stream interrupted on `{stage}`, {source}"))]
    StreamRead {
        stage: &'static str,
        source: reqwest::Error,
    },
}

pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;

    /// Creates a conversation seeded with its first query.
    fn create_conversation<'a>(
        &'a self,
        first_query: &'a str,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>>;

    fn list_conversations<'a>(
        &'a self,
        query: ConversationQuery,
    ) -> BoxFuture<'a, BackendResult<ConversationPage>>;

    fn fetch_history<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        page: PageRequest,
    ) -> BoxFuture<'a, BackendResult<HistoryPage>>;

    fn rename_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>>;

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, BackendResult<()>>;

    /// Resolves once the server accepted the exchange; the returned feed carries the records.
    fn open_stream<'a>(&'a self, request: StreamRequest)
    -> BoxFuture<'a, BackendResult<ByteStream>>;
}
