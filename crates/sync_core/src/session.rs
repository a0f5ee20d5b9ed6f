use std::{
    collections::{BTreeSet, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use futures::StreamExt;
use shared::{
    domain::ConversationKey,
    protocol::{ClientRequest, EventKind, ServerEvent},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{OutboundPolicy, ReconnectPolicy, Settings},
    error::{ConnectError, SessionError, TransportError},
    lock_unpoisoned,
    transport::{Transport, TransportConnection},
};

const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Returned by the `on*` registration calls; pass to [`ConnectionSession::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub type EventHandler = Arc<dyn Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync>;
pub type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct HandlerEntry {
    token: u64,
    kind: Option<EventKind>,
    handler: EventHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptKind {
    Initial,
    Retry,
}

struct SessionInner {
    state: ConnectionState,
    /// Bumped by every explicit connect and disconnect.
    generation: u64,
    /// Bumped by every installed transport connection.
    connection_id: u64,
    credential: Option<String>,
    last_error: Option<String>,
    outbound_tx: Option<mpsc::UnboundedSender<ClientRequest>>,
    queue: VecDeque<ClientRequest>,
    joined: BTreeSet<ConversationKey>,
    driver: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct SessionShared {
    url: String,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectPolicy,
    outbound: OutboundPolicy,
    inner: Mutex<SessionInner>,
    handlers: Mutex<Vec<HandlerEntry>>,
    observers: Mutex<Vec<(u64, StateObserver)>>,
    next_token: AtomicU64,
    handler_failures: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
}

pub struct ConnectionSession {
    shared: Arc<SessionShared>,
}

impl ConnectionSession {
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        reconnect: ReconnectPolicy,
        outbound: OutboundPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(SessionShared {
                url: url.into(),
                transport,
                reconnect,
                outbound,
                inner: Mutex::new(SessionInner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    connection_id: 0,
                    credential: None,
                    last_error: None,
                    outbound_tx: None,
                    queue: VecDeque::new(),
                    joined: BTreeSet::new(),
                    driver: None,
                    retry: None,
                }),
                handlers: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                handler_failures: AtomicU64::new(0),
                state_tx,
            }),
        }
    }

    pub fn from_settings(settings: &Settings, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let url = settings.hub_url()?;
        Ok(Self::new(
            url.to_string(),
            transport,
            settings.reconnect,
            settings.outbound,
        ))
    }

    pub fn state(&self) -> ConnectionState {
        lock_unpoisoned(&self.shared.inner).state
    }

    pub fn last_error(&self) -> Option<String> {
        lock_unpoisoned(&self.shared.inner).last_error.clone()
    }

    /// Number of handler invocations that returned an error or panicked.
    pub fn handler_failures(&self) -> u64 {
        self.shared.handler_failures.load(Ordering::Relaxed)
    }

    pub fn queued_len(&self) -> usize {
        lock_unpoisoned(&self.shared.inner).queue.len()
    }

    pub fn joined_conversations(&self) -> Vec<ConversationKey> {
        lock_unpoisoned(&self.shared.inner)
            .joined
            .iter()
            .copied()
            .collect()
    }

    /// Opens the transport, or joins the attempt already in flight.
    pub async fn connect(&self, credential: &str) -> Result<(), SessionError> {
        let generation = {
            let mut inner = lock_unpoisoned(&self.shared.inner);
            match inner.state {
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting => {
                    inner.credential = Some(credential.to_string());
                    None
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    inner.generation += 1;
                    inner.credential = Some(credential.to_string());
                    inner.last_error = None;
                    self.shared
                        .set_state(&mut inner, ConnectionState::Connecting);
                    Some(inner.generation)
                }
            }
        };

        match generation {
            None => self.wait_connected().await,
            Some(generation) => {
                self.shared.notify_state(ConnectionState::Connecting);
                info!(generation, url = %self.shared.url, "connecting to realtime hub");
                SessionShared::establish(&self.shared, generation, AttemptKind::Initial).await
            }
        }
    }

    /// Tears the transport down and cancels any pending reconnect.
    pub async fn disconnect(&self) {
        let (driver, retry, changed) = {
            let mut inner = lock_unpoisoned(&self.shared.inner);
            inner.generation += 1;
            inner.outbound_tx = None;
            let dropped = inner.queue.len();
            inner.queue.clear();
            inner.joined.clear();
            if dropped > 0 {
                warn!(dropped, "dropping queued outbound calls on disconnect");
            }
            let changed = self
                .shared
                .set_state(&mut inner, ConnectionState::Disconnected);
            (inner.driver.take(), inner.retry.take(), changed)
        };

        if let Some(retry) = retry {
            retry.abort();
        }
        if let Some(mut driver) = driver {
            // Dropping the sender lets the driver close the sink; abort if it hangs.
            if tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }
        if changed {
            info!("disconnected from realtime hub");
            self.shared.notify_state(ConnectionState::Disconnected);
        }
    }

    /// Resolves on the next `Connected`; rejects on `Failed` or `Disconnected`.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    let reason = self
                        .last_error()
                        .unwrap_or_else(|| "connection failed".to_string());
                    return Err(SessionError::Failed(reason));
                }
                ConnectionState::Disconnected => {
                    return Err(SessionError::NotConnected { state })
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::Cancelled);
            }
        }
    }

    /// Sends a hub call, queuing it while (re)connecting if configured to.
    pub fn invoke(&self, request: ClientRequest) -> Result<(), SessionError> {
        let mut inner = lock_unpoisoned(&self.shared.inner);
        match inner.state {
            ConnectionState::Connected => {
                let Some(tx) = inner.outbound_tx.clone() else {
                    return self.shared.enqueue(&mut inner, request);
                };
                match tx.send(request) {
                    Ok(()) => Ok(()),
                    // Driver already gone; the close notification is on its way.
                    Err(mpsc::error::SendError(request)) => self.shared.enqueue(&mut inner, request),
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.shared.enqueue(&mut inner, request)
            }
            state @ (ConnectionState::Disconnected | ConnectionState::Failed) => {
                Err(SessionError::NotConnected { state })
            }
        }
    }

    /// Subscribes to a conversation channel; it is rejoined after reconnects.
    pub fn join(&self, conversation: ConversationKey) -> Result<(), SessionError> {
        let connected = {
            let mut inner = lock_unpoisoned(&self.shared.inner);
            if !inner.joined.insert(conversation) {
                return Ok(());
            }
            inner.state == ConnectionState::Connected
        };
        if connected {
            self.invoke(ClientRequest::JoinConversation { conversation })?;
        }
        Ok(())
    }

    pub fn leave(&self, conversation: ConversationKey) -> Result<(), SessionError> {
        let connected = {
            let mut inner = lock_unpoisoned(&self.shared.inner);
            if !inner.joined.remove(&conversation) {
                return Ok(());
            }
            inner.state == ConnectionState::Connected
        };
        if connected {
            self.invoke(ClientRequest::LeaveConversation { conversation })?;
        }
        Ok(())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Registers a handler for every event kind.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    pub fn on_state_change<F>(&self, observer: F) -> SubscriptionToken
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.shared.observers).push((token, Arc::new(observer)));
        SubscriptionToken(token)
    }

    /// Removes one handler or observer. Unknown tokens are ignored.
    pub fn off(&self, token: SubscriptionToken) {
        let mut handlers = lock_unpoisoned(&self.shared.handlers);
        if let Some(index) = handlers.iter().position(|entry| entry.token == token.0) {
            handlers.remove(index);
            return;
        }
        drop(handlers);
        lock_unpoisoned(&self.shared.observers).retain(|(id, _)| *id != token.0);
    }

    fn register(&self, kind: Option<EventKind>, handler: EventHandler) -> SubscriptionToken {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        lock_unpoisoned(&self.shared.handlers).push(HandlerEntry {
            token,
            kind,
            handler,
        });
        SubscriptionToken(token)
    }
}

impl SessionShared {
    fn set_state(&self, inner: &mut SessionInner, next: ConnectionState) -> bool {
        if inner.state == next {
            return false;
        }
        debug!(from = ?inner.state, to = ?next, "connection state transition");
        inner.state = next;
        self.state_tx.send_replace(next);
        true
    }

    fn notify_state(&self, state: ConnectionState) {
        let observers: Vec<StateObserver> = lock_unpoisoned(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(state))).is_err() {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(?state, "connection state observer panicked");
            }
        }
    }

    fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = lock_unpoisoned(&self.handlers)
            .iter()
            .filter(|entry| entry.kind.map_or(true, |wanted| wanted == kind))
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(event = kind.name(), "event handler failed: {err:#}");
                }
                Err(_) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(event = kind.name(), "event handler panicked");
                }
            }
        }
    }

    fn enqueue(&self, inner: &mut SessionInner, request: ClientRequest) -> Result<(), SessionError> {
        match self.outbound {
            OutboundPolicy::FailFast => Err(SessionError::NotConnected { state: inner.state }),
            OutboundPolicy::Queue { capacity } => {
                while inner.queue.len() >= capacity.max(1) {
                    if let Some(dropped) = inner.queue.pop_front() {
                        warn!(
                            method = dropped.method_name(),
                            capacity, "outbound queue full; dropping oldest call"
                        );
                    }
                }
                debug!(method = request.method_name(), "queued outbound call");
                inner.queue.push_back(request);
                Ok(())
            }
        }
    }

    async fn establish(
        this: &Arc<Self>,
        generation: u64,
        attempt: AttemptKind,
    ) -> Result<(), SessionError> {
        let credential = {
            let inner = lock_unpoisoned(&this.inner);
            if inner.generation != generation {
                return Err(SessionError::Cancelled);
            }
            inner.credential.clone().unwrap_or_default()
        };

        match this.transport.connect(&this.url, &credential).await {
            Ok(connection) => Self::install(this, generation, connection),
            Err(err) => {
                let fatal = matches!(err, ConnectError::Auth(_));
                if fatal || attempt == AttemptKind::Initial {
                    if !this.fail(generation, err.to_string()) {
                        return Err(SessionError::Cancelled);
                    }
                }
                Err(err.into())
            }
        }
    }

    fn install(
        this: &Arc<Self>,
        generation: u64,
        connection: TransportConnection,
    ) -> Result<(), SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = lock_unpoisoned(&this.inner);
            let expecting = matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            );
            if inner.generation != generation || !expecting {
                debug!(generation, "discarding superseded transport connection");
                return Err(SessionError::Cancelled);
            }

            let rejoin: Vec<ClientRequest> = inner
                .joined
                .iter()
                .map(|conversation| ClientRequest::JoinConversation {
                    conversation: *conversation,
                })
                .collect();
            let flushed = inner.queue.len();
            for request in rejoin.into_iter().chain(inner.queue.drain(..)) {
                // Receiver is alive: it is moved into the driver below.
                let _ = tx.send(request);
            }
            if flushed > 0 {
                debug!(flushed, "flushing queued outbound calls");
            }

            inner.connection_id += 1;
            let connection_id = inner.connection_id;
            inner.outbound_tx = Some(tx);
            inner.driver = Some(tokio::spawn(drive(
                Arc::downgrade(this),
                generation,
                connection_id,
                connection,
                rx,
            )));
            inner.retry = None;
            inner.last_error = None;
            this.set_state(&mut inner, ConnectionState::Connected);
        }
        info!(generation, "connected to realtime hub");
        this.notify_state(ConnectionState::Connected);
        Ok(())
    }

    /// Moves to `Failed` unless the attempt was superseded.
    fn fail(&self, generation: u64, reason: String) -> bool {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.generation != generation {
                return false;
            }
            warn!(generation, %reason, "realtime connection failed");
            inner.last_error = Some(reason);
            inner.outbound_tx = None;
            let dropped = inner.queue.len();
            inner.queue.clear();
            if dropped > 0 {
                warn!(dropped, "dropping queued outbound calls after failure");
            }
            if !self.set_state(&mut inner, ConnectionState::Failed) {
                return true;
            }
        }
        self.notify_state(ConnectionState::Failed);
        true
    }

    fn handle_unexpected_close(this: &Arc<Self>, generation: u64, connection_id: u64, reason: TransportError) {
        {
            let mut inner = lock_unpoisoned(&this.inner);
            if inner.generation != generation
                || inner.connection_id != connection_id
                || inner.state != ConnectionState::Connected
            {
                return;
            }
            warn!(generation, %reason, "realtime transport closed unexpectedly");
            inner.outbound_tx = None;
            inner.driver = None;
            inner.last_error = Some(reason.to_string());
            this.set_state(&mut inner, ConnectionState::Reconnecting);
        }
        this.notify_state(ConnectionState::Reconnecting);

        let retry = tokio::spawn(reconnect_loop(
            Arc::downgrade(this),
            generation,
            this.reconnect,
        ));
        let mut inner = lock_unpoisoned(&this.inner);
        if inner.generation == generation && inner.state == ConnectionState::Reconnecting {
            inner.retry = Some(retry);
        } else if inner.state != ConnectionState::Connected {
            retry.abort();
        }
    }

    fn is_reconnecting(&self, generation: u64) -> bool {
        let inner = lock_unpoisoned(&self.inner);
        inner.generation == generation && inner.state == ConnectionState::Reconnecting
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(retry) = inner.retry.take() {
            retry.abort();
        }
        if let Some(driver) = inner.driver.take() {
            driver.abort();
        }
    }
}

/// Owns the transport connection for its whole life.
async fn drive(
    session: Weak<SessionShared>,
    generation: u64,
    connection_id: u64,
    connection: TransportConnection,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
) {
    let TransportConnection {
        mut sink,
        mut events,
    } = connection;

    let failure = loop {
        tokio::select! {
            request = outbound.recv() => match request {
                Some(request) => {
                    if let Err(err) = sink.send(&request).await {
                        warn!(method = request.method_name(), "outbound call lost: {err}");
                        break Some(err);
                    }
                }
                None => {
                    sink.close().await;
                    break None;
                }
            },
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let Some(shared) = session.upgrade() else {
                        break None;
                    };
                    shared.dispatch(&event);
                }
                Some(Err(err)) => break Some(err),
                None => break Some(TransportError::Closed),
            },
        }
    };

    if let Some(reason) = failure {
        if let Some(shared) = session.upgrade() {
            SessionShared::handle_unexpected_close(&shared, generation, connection_id, reason);
        }
    }
}

async fn reconnect_loop(session: Weak<SessionShared>, generation: u64, policy: ReconnectPolicy) {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let delay = policy.delay_for(attempt);
        if attempt > policy.max_attempts || started.elapsed() + delay > policy.max_duration {
            if let Some(shared) = session.upgrade() {
                shared.fail(
                    generation,
                    format!("gave up reconnecting after {} attempts", attempt - 1),
                );
            }
            return;
        }

        tokio::time::sleep(delay).await;

        let Some(shared) = session.upgrade() else {
            return;
        };
        if !shared.is_reconnecting(generation) {
            debug!(generation, attempt, "stale reconnect attempt ignored");
            return;
        }
        info!(generation, attempt, "reconnecting to realtime hub");
        match SessionShared::establish(&shared, generation, AttemptKind::Retry).await {
            Ok(()) => return,
            Err(SessionError::Auth(_)) | Err(SessionError::Cancelled) => return,
            Err(err) => warn!(generation, attempt, "reconnect attempt failed: {err}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
