//! Scripted in-memory backend for the session and coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use parley_backend::{
    BackendError, BackendResult, BoxFuture, ByteStream, ChatBackend, ConversationId,
    ConversationPage, ConversationQuery, ConversationRecord, HistoryPage, MessageRecord,
    PageRequest, RemoteMessageId, RemoteRole, StreamRequest,
};

enum ScriptedStream {
    Feed(ByteStream),
    Reject { status: u16, detail: String },
}

/// Write side of one scripted stream.
pub(crate) struct FeedHandle {
    tx: mpsc::UnboundedSender<BackendResult<Bytes>>,
}

impl FeedHandle {
    pub(crate) fn send_raw(&self, raw: &str) {
        let _ = self.tx.unbounded_send(Ok(Bytes::from(raw.to_string())));
    }

    pub(crate) fn send_record(&self, payload: &str) {
        self.send_raw(&format!("data: {payload}\n\n"));
    }

    pub(crate) fn fail(&self, detail: &str) {
        let _ = self.tx.unbounded_send(Err(BackendError::Status {
            stage: "scripted-stream",
            status: 502,
            detail: detail.to_string(),
        }));
    }

    pub(crate) fn close(self) {
        self.tx.close_channel();
    }

    pub(crate) fn is_released(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits until the consumer dropped its end of the feed.
    pub(crate) async fn wait_until_released(&self) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !self.is_released() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("feed released");
    }
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    next_conversation: AtomicU64,
    create_failure: Mutex<Option<String>>,
    conversations: Mutex<Vec<ConversationRecord>>,
    histories: Mutex<HashMap<String, BackendResult<HistoryPage>>>,
    history_calls: AtomicUsize,
    streams: Mutex<VecDeque<ScriptedStream>>,
    stream_requests: Mutex<Vec<StreamRequest>>,
    deleted: Mutex<Vec<ConversationId>>,
}

impl ScriptedBackend {
    pub(crate) fn push_feed(&self) -> FeedHandle {
        let (tx, rx) = mpsc::unbounded();
        self.streams
            .lock()
            .unwrap()
            .push_back(ScriptedStream::Feed(rx.boxed()));
        FeedHandle { tx }
    }

    pub(crate) fn push_rejection(&self, status: u16, detail: &str) {
        self.streams.lock().unwrap().push_back(ScriptedStream::Reject {
            status,
            detail: detail.to_string(),
        });
    }

    pub(crate) fn fail_next_create(&self, detail: &str) {
        *self.create_failure.lock().unwrap() = Some(detail.to_string());
    }

    pub(crate) fn set_conversations(&self, records: Vec<ConversationRecord>) {
        *self.conversations.lock().unwrap() = records;
    }

    pub(crate) fn set_history(&self, conversation_id: &str, title: &str, turns: &[(RemoteRole, &str)]) {
        let messages = turns
            .iter()
            .enumerate()
            .map(|(index, (role, content))| MessageRecord {
                id: RemoteMessageId::parse(&format!("{conversation_id}-{index}")).unwrap(),
                role: *role,
                content: content.to_string(),
                created_at: None,
            })
            .collect::<Vec<_>>();
        let page = HistoryPage {
            total: messages.len() as u64,
            messages,
            conversation_title: title.to_string(),
            has_more: false,
        };
        self.histories
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), Ok(page));
    }

    pub(crate) fn fail_history(&self, conversation_id: &str, detail: &str) {
        self.histories.lock().unwrap().insert(
            conversation_id.to_string(),
            Err(BackendError::Status {
                stage: "scripted-history",
                status: 500,
                detail: detail.to_string(),
            }),
        );
    }

    pub(crate) fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_requests(&self) -> Vec<StreamRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<ConversationId> {
        self.deleted.lock().unwrap().clone()
    }
}

fn record(id: &str, title: &str) -> ConversationRecord {
    ConversationRecord {
        id: ConversationId::parse(id).unwrap(),
        title: title.to_string(),
        created_at: None,
    }
}

impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        "scripted"
    }

    fn create_conversation<'a>(
        &'a self,
        first_query: &'a str,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>> {
        Box::pin(async move {
            if let Some(detail) = self.create_failure.lock().unwrap().take() {
                return Err(BackendError::Status {
                    stage: "scripted-create",
                    status: 500,
                    detail,
                });
            }
            let next = self.next_conversation.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(record(&format!("new-{next}"), first_query))
        })
    }

    fn list_conversations<'a>(
        &'a self,
        query: ConversationQuery,
    ) -> BoxFuture<'a, BackendResult<ConversationPage>> {
        Box::pin(async move {
            let conversations = self
                .conversations
                .lock()
                .unwrap()
                .iter()
                .filter(|record| match &query.search {
                    Some(search) => record.title.contains(search.as_str()),
                    None => true,
                })
                .take(query.limit as usize)
                .cloned()
                .collect::<Vec<_>>();
            Ok(ConversationPage {
                total: conversations.len() as u64,
                conversations,
                has_more: false,
            })
        })
    }

    fn fetch_history<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        _page: PageRequest,
    ) -> BoxFuture<'a, BackendResult<HistoryPage>> {
        Box::pin(async move {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            match self.histories.lock().unwrap().remove(conversation_id.as_str()) {
                Some(result) => result,
                None => Ok(HistoryPage::default()),
            }
        })
    }

    fn rename_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
        title: &'a str,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>> {
        Box::pin(async move { Ok(record(conversation_id.as_str(), title)) })
    }

    fn delete_conversation<'a>(
        &'a self,
        conversation_id: &'a ConversationId,
    ) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            self.deleted.lock().unwrap().push(conversation_id.clone());
            Ok(())
        })
    }

    fn open_stream<'a>(&'a self, request: StreamRequest) -> BoxFuture<'a, BackendResult<ByteStream>> {
        Box::pin(async move {
            self.stream_requests.lock().unwrap().push(request);
            match self.streams.lock().unwrap().pop_front() {
                Some(ScriptedStream::Feed(feed)) => Ok(feed),
                Some(ScriptedStream::Reject { status, detail }) => Err(BackendError::Status {
                    stage: "scripted-open",
                    status,
                    detail,
                }),
                None => Err(BackendError::Status {
                    stage: "scripted-open",
                    status: 500,
                    detail: "no scripted stream".to_string(),
                }),
            }
        })
    }
}
