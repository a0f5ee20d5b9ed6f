use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use shared::{
    domain::{ConversationKey, GroupId, Message, MessageId, MessageKind, Reaction, UserId},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::{ConnectError, HistoryFetchError, TransportError},
    history::HistoryApi,
    transport::{Transport, TransportConnection, TransportSink},
};

pub fn direct(peer: i64) -> ConversationKey {
    ConversationKey::Direct(UserId(peer))
}

pub fn group(id: i64) -> ConversationKey {
    ConversationKey::Group(GroupId(id))
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(id: i64, conversation: ConversationKey, secs: i64) -> Message {
    Message {
        id: MessageId(id),
        conversation,
        sender_id: UserId(42),
        sender_name: Some("ana".into()),
        body: format!("message {id}"),
        sent_at: at(secs),
        edited_at: None,
        deleted_at: None,
        kind: MessageKind::Text,
        media_url: None,
    }
}

pub fn message_from(
    id: i64,
    conversation: ConversationKey,
    secs: i64,
    sender: i64,
) -> Message {
    Message {
        sender_id: UserId(sender),
        sender_name: Some(format!("user{sender}")),
        ..message(id, conversation, secs)
    }
}

pub fn reaction(message_id: i64, reactor: i64, emoji: &str) -> Reaction {
    Reaction {
        message_id: MessageId(message_id),
        reactor_id: UserId(reactor),
        reactor_name: None,
        emoji: emoji.to_string(),
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type EventSender = mpsc::UnboundedSender<Result<ServerEvent, TransportError>>;

#[derive(Default)]
struct FakeTransportState {
    failures: VecDeque<ConnectError>,
    current: Option<EventSender>,
    credentials: Vec<String>,
}

/// Channel-backed transport; each successful connect opens a fresh stream.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeTransportState>,
    sent: Arc<Mutex<Vec<ClientRequest>>>,
    connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next connect attempts fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ConnectError>) {
        self.state.lock().unwrap().failures.extend(errors);
    }

    pub fn fail_always(&self, count: usize) {
        self.fail_next(
            (0..count).map(|_| ConnectError::Transport(TransportError::Connect("refused".into()))),
        );
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn credentials(&self) -> Vec<String> {
        self.state.lock().unwrap().credentials.clone()
    }

    pub fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Delivers an event on the current connection. `false` if none is open.
    pub fn push(&self, event: ServerEvent) -> bool {
        self.state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(event)).is_ok())
    }

    /// Ends the current connection as if the server went away.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.lock().unwrap().current.take() {
            let _ = tx.send(Err(TransportError::Stream("connection reset".into())));
        }
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

struct FakeSink {
    sent: Arc<Mutex<Vec<ClientRequest>>>,
}

#[async_trait]
impl TransportSink for FakeSink {
    async fn send(&mut self, request: &ClientRequest) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _url: &str,
        credential: &str,
    ) -> Result<TransportConnection, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.credentials.push(credential.to_string());
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(TransportConnection {
            sink: Box::new(FakeSink {
                sent: Arc::clone(&self.sent),
            }),
            events: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

/// In-memory history backend keyed by `(conversation, page)`.
#[derive(Default)]
pub struct FakeHistory {
    pages: Mutex<HashMap<(ConversationKey, u32), Vec<Message>>>,
    reactions: Mutex<HashMap<MessageId, Vec<Reaction>>>,
    requests: Mutex<Vec<(ConversationKey, u32)>>,
}

impl FakeHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_page(&self, conversation: ConversationKey, page: u32, messages: Vec<Message>) {
        self.pages
            .lock()
            .unwrap()
            .insert((conversation, page), messages);
    }

    pub fn set_reactions(&self, message_id: i64, reactions: Vec<Reaction>) {
        self.reactions
            .lock()
            .unwrap()
            .insert(MessageId(message_id), reactions);
    }

    pub fn requests(&self) -> Vec<(ConversationKey, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn fetch_messages(
        &self,
        conversation: ConversationKey,
        page: u32,
        _page_size: u32,
    ) -> Result<Vec<Message>, HistoryFetchError> {
        self.requests.lock().unwrap().push((conversation, page));
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&(conversation, page))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_reactions(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Reaction>, HistoryFetchError> {
        Ok(self
            .reactions
            .lock()
            .unwrap()
            .get(&message_id)
            .cloned()
            .unwrap_or_default())
    }
}
