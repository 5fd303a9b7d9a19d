use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};

use super::backend::{
    BackendConfig, BackendResult, BoxFuture, ByteStream, ChatBackend, DecodeSnafu, EmptyQuerySnafu,
    HttpClientSnafu, StatusSnafu, StreamReadSnafu, StreamRequest, UnauthorizedSnafu,
};
use super::ids::ConversationId;
use super::model::{
    ConversationPage, ConversationQuery, ConversationRecord, HistoryPage, PageRequest, QueryBody,
    TitleBody,
};

pub const HTTP_BACKEND_ID: &str = "http";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBackend {
    client: reqwest::Client,
    // Swappable so the token can change (or be cleared on 401) without rebuilding the client.
    config: Arc<ArcSwap<BackendConfig>>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(HttpClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self {
            client,
            config: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    pub fn config(&self) -> Arc<BackendConfig> {
        self.config.load_full()
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        self.config.rcu(|current| {
            let next = BackendConfig::clone(current).with_auth_token(token.clone());
            Arc::new(next)
        });
    }

    fn request(&self, method: Method, path: &str) -> (RequestBuilder, Arc<BackendConfig>) {
        let config = self.config();
        let url = config.endpoint(path);

        if config.log_requests {
            tracing::debug!(method = %method, url = %url, "backend request");
        }

        let mut builder = self.client.request(method, url);
        if let Some(token) = &config.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        (builder, config)
    }

    async fn send_json<T>(&self, builder: RequestBuilder, stage: &'static str) -> BackendResult<T>
    where
        T: DeserializeOwned,
    {
        let response = builder.send().await.context(HttpClientSnafu { stage })?;
        let response = self.check_status(response, stage).await?;
        let payload = response.text().await.context(HttpClientSnafu { stage })?;

        if self.config().log_requests {
            tracing::debug!(stage, payload_len = payload.len(), "backend response");
        }

        serde_json::from_str(&payload).context(DecodeSnafu { stage })
    }

    async fn check_status(&self, response: Response, stage: &'static str) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = extract_error_detail(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(stage, "backend rejected credentials; clearing auth token");
            self.set_auth_token(None);
            return UnauthorizedSnafu { stage, detail }.fail();
        }

        if status.is_server_error() {
            tracing::error!(stage, status = status.as_u16(), detail = %detail, "backend server error");
        }

        StatusSnafu {
            stage,
            status: status.as_u16(),
            detail,
        }
        .fail()
    }
}

/// Pulls the human-readable reason out of an error body (`detail`, then `message`).
pub(crate) fn extract_error_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let detail = value.get("detail").or_else(|| value.get("message"))?;

    match detail {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) if text.trim().is_empty() => None,
        serde_json::Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

impl ChatBackend for HttpBackend {
    fn id(&self) -> &str {
        HTTP_BACKEND_ID
    }

    fn create_conversation<'a>(
        &'a self,
        first_query: &'a str,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>> {
        Box::pin(async move {
            ensure!(
                !first_query.trim().is_empty(),
                EmptyQuerySnafu {
                    stage: "create-conversation",
                }
            );

            let (builder, config) = self.request(Method::POST, "conversations/");
            let builder = builder
                .timeout(config.request_timeout)
                .json(&QueryBody { query: first_query });
            self.send_json(builder, "create-conversation").await
        })
    }

    fn list_conversations<'a>(
        &'a self,
        query: ConversationQuery,
    ) -> BoxFuture<'a, BackendResult<ConversationPage>> {
        Box::pin(async move {
            let (builder, config) = self.request(Method::GET, "conversations/");
            let mut builder = builder
                .timeout(config.request_timeout)
                .query(&[("limit", query.limit), ("offset", query.offset)]);
            if let Some(search) = &query.search {
                builder = builder.query(&[("search", search)]);
            }
            self.send_json(builder, "list-conversations").await
        })
    }

    fn fetch_history<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        page: PageRequest,
    ) -> BoxFuture<'a, BackendResult<HistoryPage>> {
        Box::pin(async move {
            let path = format!("conversations/{conversation_id}/messages/");
            let (builder, config) = self.request(Method::GET, &path);
            let builder = builder
                .timeout(config.request_timeout)
                .query(&[("limit", page.limit), ("offset", page.offset)]);
            self.send_json(builder, "fetch-history").await
        })
    }

    fn rename_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>> {
        Box::pin(async move {
            let path = format!("conversations/{conversation_id}/");
            let (builder, config) = self.request(Method::PATCH, &path);
            let builder = builder
                .timeout(config.request_timeout)
                .json(&TitleBody { title });
            self.send_json(builder, "rename-conversation").await
        })
    }

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let path = format!("conversations/{conversation_id}/");
            let (builder, config) = self.request(Method::DELETE, &path);
            let response = builder
                .timeout(config.request_timeout)
                .send()
                .await
                .context(HttpClientSnafu {
                    stage: "delete-conversation",
                })?;
            self.check_status(response, "delete-conversation").await?;
            Ok(())
        })
    }

    fn open_stream<'a>(
        &'a self,
        request: StreamRequest,
    ) -> BoxFuture<'a, BackendResult<ByteStream>> {
        Box::pin(async move {
            ensure!(
                !request.query.trim().is_empty(),
                EmptyQuerySnafu {
                    stage: "open-stream",
                }
            );

            let path = match &request.conversation_id {
                Some(conversation_id) => format!("stream/chat/{conversation_id}"),
                None => "stream/query".to_string(),
            };

            // No overall timeout here: the exchange stays open for as long as the model writes.
            let (builder, _) = self.request(Method::POST, &path);
            let response = builder
                .header(ACCEPT, "text/event-stream")
                .json(&QueryBody {
                    query: &request.query,
                })
                .send()
                .await
                .context(HttpClientSnafu {
                    stage: "open-stream",
                })?;
            let response = self.check_status(response, "open-stream").await?;

            let stream = response.bytes_stream().map(|chunk| {
                chunk.context(StreamReadSnafu {
                    stage: "read-stream-chunk",
                })
            });
            Ok(stream.boxed())
        })
    }
}
