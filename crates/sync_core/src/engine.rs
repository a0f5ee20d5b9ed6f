use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use shared::{
    domain::{
        ConversationKey, Message, MessageId, MessageKind, Notification, NotificationId, Reaction,
        UserId,
    },
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Settings,
    error::EngineError,
    history::{HistoryApi, MissingHistoryApi},
    lock_unpoisoned,
    notifications::NotificationFeed,
    reactions::EmojiSummary,
    session::{ConnectionSession, ConnectionState, SubscriptionToken},
    store::{ConversationStore, LatestPreview, MergeReport},
    typing::TypingSignal,
    unread::UnreadTracker,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ConnectionStateChanged(ConnectionState),
    MessagesChanged {
        conversation: ConversationKey,
    },
    TypingChanged {
        conversation: ConversationKey,
        typers: Vec<TypingSignal>,
    },
    UnreadChanged {
        conversation: ConversationKey,
        count: u64,
        total: u64,
    },
    ReactionsChanged {
        conversation: ConversationKey,
        message_id: MessageId,
    },
    NotificationsChanged {
        unread: u64,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    ReadReceipt {
        conversation: ConversationKey,
        reader_id: UserId,
        last_read: MessageId,
    },
}

/// Everything the engine mutates; only touched under `SyncEngine::state`.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) store: ConversationStore,
    pub(crate) unread: UnreadTracker,
    pub(crate) notifications: NotificationFeed,
    pub(crate) active: Option<ConversationKey>,
    pub(crate) open: BTreeSet<ConversationKey>,
    pub(crate) presence: HashSet<UserId>,
    pub(crate) read_markers: HashMap<ConversationKey, BTreeMap<UserId, MessageId>>,
    last_typing_sent: HashMap<ConversationKey, Instant>,
    has_connected: bool,
}

impl EngineState {
    pub(crate) fn new(settings: &Settings, local_user: UserId) -> Self {
        Self {
            store: ConversationStore::new(local_user, settings.typing_window),
            unread: UnreadTracker::new(),
            notifications: NotificationFeed::new(settings.notification_recent_capacity),
            active: None,
            open: BTreeSet::new(),
            presence: HashSet::new(),
            read_markers: HashMap::new(),
            last_typing_sent: HashMap::new(),
            has_connected: false,
        }
    }

    fn unread_event(&self, conversation: ConversationKey) -> EngineEvent {
        EngineEvent::UnreadChanged {
            conversation,
            count: self.unread.get(conversation),
            total: self.unread.total(),
        }
    }

    fn typing_event(&mut self, conversation: ConversationKey, now: Instant) -> EngineEvent {
        EngineEvent::TypingChanged {
            conversation,
            typers: self.store.typers(conversation, now),
        }
    }

    /// Makes `conversation` the one on screen; its unread count is dropped.
    fn activate(&mut self, conversation: Option<ConversationKey>) -> Vec<EngineEvent> {
        self.active = conversation;
        match conversation {
            Some(key) if self.unread.clear(key) > 0 => vec![self.unread_event(key)],
            _ => Vec::new(),
        }
    }
}

/// Folds one pushed event into engine state and reports what changed.
pub(crate) fn apply_server_event(
    state: &mut EngineState,
    event: &ServerEvent,
    now: Instant,
) -> Vec<EngineEvent> {
    let mut changes = Vec::new();
    match event {
        ServerEvent::GroupMessageReceived { message } if !message.conversation.is_group() => {
            warn!(
                conversation = %message.conversation,
                message_id = message.id.0,
                "group message addressed to a direct conversation dropped"
            );
        }
        ServerEvent::MessageReceived { message } | ServerEvent::GroupMessageReceived { message } => {
            let conversation = message.conversation;
            if state.store.clear_typing(conversation, message.sender_id) {
                changes.push(state.typing_event(conversation, now));
            }
            if !state.store.admit_live(message.clone()) {
                debug!(%conversation, message_id = message.id.0, "duplicate message ignored");
                return changes;
            }
            changes.push(EngineEvent::MessagesChanged { conversation });

            let from_peer = message.sender_id != state.store.local_user();
            if from_peer && state.active != Some(conversation) {
                state.unread.increment(conversation);
                changes.push(state.unread_event(conversation));
            }
        }
        ServerEvent::ReactionChanged {
            conversation,
            action,
            reaction,
        } => {
            let message_id = reaction.message_id;
            match state
                .store
                .apply_reaction(*conversation, *action, reaction.clone())
            {
                Ok(true) => changes.push(EngineEvent::ReactionsChanged {
                    conversation: *conversation,
                    message_id,
                }),
                Ok(false) => {}
                Err(conflict) => {
                    debug!(%conversation, message_id = message_id.0, "reaction event dropped: {conflict}")
                }
            }
        }
        ServerEvent::MessageEdited {
            conversation,
            message_id,
            body,
            edited_at,
        } => match state
            .store
            .apply_edit(*conversation, *message_id, body, *edited_at)
        {
            Ok(()) => changes.push(EngineEvent::MessagesChanged {
                conversation: *conversation,
            }),
            Err(conflict) => {
                debug!(%conversation, message_id = message_id.0, "edit dropped: {conflict}")
            }
        },
        ServerEvent::MessageDeleted {
            conversation,
            message_id,
            deleted_at,
        } => match state
            .store
            .apply_delete(*conversation, *message_id, *deleted_at)
        {
            Ok(true) => changes.push(EngineEvent::MessagesChanged {
                conversation: *conversation,
            }),
            Ok(false) => {}
            Err(conflict) => {
                debug!(%conversation, message_id = message_id.0, "delete dropped: {conflict}")
            }
        },
        ServerEvent::TypingChanged {
            conversation,
            user_id,
            user_name,
            is_typing,
        } => {
            if state
                .store
                .set_typing(*conversation, *user_id, user_name, *is_typing, now)
            {
                changes.push(state.typing_event(*conversation, now));
            }
        }
        ServerEvent::ReadReceipt {
            conversation,
            reader_id,
            last_read,
        } => {
            let markers = state.read_markers.entry(*conversation).or_default();
            let advanced = markers
                .get(reader_id)
                .map_or(true, |current| current < last_read);
            if advanced {
                markers.insert(*reader_id, *last_read);
                changes.push(EngineEvent::ReadReceipt {
                    conversation: *conversation,
                    reader_id: *reader_id,
                    last_read: *last_read,
                });
            }
        }
        ServerEvent::PresenceChanged { user_id, online } => {
            let changed = if *online {
                state.presence.insert(*user_id)
            } else {
                state.presence.remove(user_id)
            };
            if changed {
                changes.push(EngineEvent::PresenceChanged {
                    user_id: *user_id,
                    online: *online,
                });
            }
        }
        ServerEvent::NotificationReceived { notification } => {
            if state.notifications.push(notification.clone()) {
                changes.push(EngineEvent::NotificationsChanged {
                    unread: state.notifications.unread(),
                });
            }
        }
        ServerEvent::Error(err) => {
            warn!(
                code = ?err.code,
                auth = err.is_auth_failure(),
                "hub reported error: {}",
                err.message
            );
        }
    }
    changes
}

pub struct SyncEngine {
    settings: Settings,
    session: Arc<ConnectionSession>,
    history: Arc<dyn HistoryApi>,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    subscriptions: Mutex<Vec<SubscriptionToken>>,
}

impl SyncEngine {
    /// Engine without a history backend; history loads fail with `Unavailable`.
    pub fn new(settings: Settings, session: Arc<ConnectionSession>, local_user: UserId) -> Arc<Self> {
        Self::new_with_history(settings, session, Arc::new(MissingHistoryApi), local_user)
    }

    pub fn new_with_history(
        settings: Settings,
        session: Arc<ConnectionSession>,
        history: Arc<dyn HistoryApi>,
        local_user: UserId,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let engine = Arc::new(Self {
            state: Mutex::new(EngineState::new(&settings, local_user)),
            settings,
            session,
            history,
            events,
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&engine);
        let on_event = engine.session.on_any(move |event| {
            if let Some(engine) = weak.upgrade() {
                engine.handle_server_event(event);
            }
            Ok(())
        });
        let weak = Arc::downgrade(&engine);
        let on_state = engine.session.on_state_change(move |state| {
            if let Some(engine) = weak.upgrade() {
                engine.handle_state_change(state);
            }
        });
        lock_unpoisoned(&engine.subscriptions).extend([on_event, on_state]);
        engine
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }

    pub fn local_user(&self) -> UserId {
        lock_unpoisoned(&self.state).store.local_user()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Connects the session. Open conversations are registered with it
    /// first so they are rejoined ahead of any queued call.
    pub async fn connect(&self, credential: &str) -> Result<(), EngineError> {
        let open: Vec<ConversationKey> =
            lock_unpoisoned(&self.state).open.iter().copied().collect();
        for conversation in open {
            self.session.join(conversation)?;
        }
        Ok(self.session.connect(credential).await?)
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Opens a conversation: joins its channel, makes it active and loads
    /// the newest history page.
    pub async fn open_conversation(
        &self,
        conversation: ConversationKey,
    ) -> Result<MergeReport, EngineError> {
        let changes = {
            let mut state = lock_unpoisoned(&self.state);
            state.open.insert(conversation);
            state.activate(Some(conversation))
        };
        self.emit(changes);
        self.session.join(conversation)?;
        info!(%conversation, "opened conversation");
        self.fetch_page(conversation, 1).await
    }

    pub fn close_conversation(&self, conversation: ConversationKey) -> Result<(), EngineError> {
        {
            let mut state = lock_unpoisoned(&self.state);
            state.open.remove(&conversation);
            if state.active == Some(conversation) {
                state.active = None;
            }
            state.last_typing_sent.remove(&conversation);
        }
        self.session.leave(conversation)?;
        Ok(())
    }

    pub fn set_active(&self, conversation: Option<ConversationKey>) {
        let changes = lock_unpoisoned(&self.state).activate(conversation);
        self.emit(changes);
    }

    pub fn active_conversation(&self) -> Option<ConversationKey> {
        lock_unpoisoned(&self.state).active
    }

    pub fn open_conversations(&self) -> Vec<ConversationKey> {
        lock_unpoisoned(&self.state).open.iter().copied().collect()
    }

    /// Refetches the newest page of a conversation.
    pub async fn load_history(
        &self,
        conversation: ConversationKey,
    ) -> Result<MergeReport, EngineError> {
        self.fetch_page(conversation, 1).await
    }

    /// Loads the next older page, if the server reported more.
    pub async fn load_older(
        &self,
        conversation: ConversationKey,
    ) -> Result<MergeReport, EngineError> {
        let page = {
            let state = lock_unpoisoned(&self.state);
            match state.store.log(conversation) {
                Some(log) if !log.has_more() => return Ok(MergeReport::default()),
                Some(log) => log.next_page(),
                None => 1,
            }
        };
        self.fetch_page(conversation, page).await
    }

    /// Replaces a message's reactions with the server's list.
    pub async fn load_reactions(
        &self,
        conversation: ConversationKey,
        message_id: MessageId,
    ) -> Result<(), EngineError> {
        let reactions = self.history.fetch_reactions(message_id).await?;
        let applied = lock_unpoisoned(&self.state).store.replace_reactions(
            conversation,
            message_id,
            reactions,
        );
        match applied {
            Ok(()) => self.emit(vec![EngineEvent::ReactionsChanged {
                conversation,
                message_id,
            }]),
            Err(conflict) => debug!(%conversation, "reaction list dropped: {conflict}"),
        }
        Ok(())
    }

    /// Returns the client nonce the server echoes back with the stored message.
    pub fn send_message(
        &self,
        conversation: ConversationKey,
        body: &str,
    ) -> Result<Uuid, EngineError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(EngineError::Validation("message body is empty".into()));
        }
        self.send_with_nonce(conversation, body.to_string(), MessageKind::Text, None)
    }

    pub fn send_media(
        &self,
        conversation: ConversationKey,
        media_url: &str,
        caption: Option<&str>,
    ) -> Result<Uuid, EngineError> {
        let media_url = media_url.trim();
        if media_url.is_empty() {
            return Err(EngineError::Validation("media reference is empty".into()));
        }
        let caption = caption.map(str::trim).unwrap_or_default().to_string();
        self.send_with_nonce(
            conversation,
            caption,
            MessageKind::Media,
            Some(media_url.to_string()),
        )
    }

    /// `Ok(false)` when a repeated `true` was suppressed by the debounce.
    pub fn send_typing(
        &self,
        conversation: ConversationKey,
        is_typing: bool,
    ) -> Result<bool, EngineError> {
        self.send_typing_at(conversation, is_typing, Instant::now())
    }

    pub fn react(
        &self,
        conversation: ConversationKey,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), EngineError> {
        let emoji = validate_emoji(emoji)?;
        self.invoke(ClientRequest::React {
            conversation,
            message_id,
            emoji,
        })
    }

    pub fn remove_reaction(
        &self,
        conversation: ConversationKey,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), EngineError> {
        let emoji = validate_emoji(emoji)?;
        self.invoke(ClientRequest::RemoveReaction {
            conversation,
            message_id,
            emoji,
        })
    }

    pub fn edit_message(
        &self,
        conversation: ConversationKey,
        message_id: MessageId,
        body: &str,
    ) -> Result<(), EngineError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(EngineError::Validation("edited body is empty".into()));
        }
        self.invoke(ClientRequest::EditMessage {
            conversation,
            message_id,
            body: body.to_string(),
        })
    }

    pub fn delete_message(
        &self,
        conversation: ConversationKey,
        message_id: MessageId,
    ) -> Result<(), EngineError> {
        self.invoke(ClientRequest::DeleteMessage {
            conversation,
            message_id,
        })
    }

    /// Tells the server up to which message the conversation was read, then
    /// clears the local counter. A rejected call leaves the counter alone.
    pub fn mark_read(&self, conversation: ConversationKey) -> Result<(), EngineError> {
        let up_to = lock_unpoisoned(&self.state)
            .store
            .log(conversation)
            .and_then(|log| log.newest())
            .map(|message| message.id);
        self.invoke(ClientRequest::MarkRead {
            conversation,
            up_to,
        })?;
        let changes = {
            let mut state = lock_unpoisoned(&self.state);
            if state.unread.clear(conversation) > 0 {
                vec![state.unread_event(conversation)]
            } else {
                Vec::new()
            }
        };
        self.emit(changes);
        Ok(())
    }

    pub fn mark_all_notifications_read(&self) -> Result<(), EngineError> {
        self.invoke(ClientRequest::MarkAllNotificationsRead)?;
        lock_unpoisoned(&self.state).notifications.mark_all_read();
        self.emit(vec![EngineEvent::NotificationsChanged { unread: 0 }]);
        Ok(())
    }

    /// Local only; the server learns about individual reads through its own UI.
    pub fn mark_notification_read(&self, id: NotificationId) -> bool {
        let unread = {
            let mut state = lock_unpoisoned(&self.state);
            if !state.notifications.mark_read(id) {
                return false;
            }
            state.notifications.unread()
        };
        self.emit(vec![EngineEvent::NotificationsChanged { unread }]);
        true
    }

    pub fn messages(&self, conversation: ConversationKey) -> Vec<Message> {
        lock_unpoisoned(&self.state).store.messages(conversation)
    }

    pub fn has_more_history(&self, conversation: ConversationKey) -> bool {
        lock_unpoisoned(&self.state)
            .store
            .log(conversation)
            .map_or(true, |log| log.has_more())
    }

    pub fn latest(&self, conversation: ConversationKey) -> Option<LatestPreview> {
        lock_unpoisoned(&self.state).store.project_latest(conversation)
    }

    /// Previews for every known conversation, most recent first.
    pub fn conversation_list(&self) -> Vec<(ConversationKey, LatestPreview)> {
        let state = lock_unpoisoned(&self.state);
        let mut previews: Vec<_> = state
            .store
            .conversations()
            .into_iter()
            .filter_map(|key| state.store.project_latest(key).map(|latest| (key, latest)))
            .collect();
        previews.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then_with(|| a.0.cmp(&b.0)));
        previews
    }

    pub fn unread(&self, conversation: ConversationKey) -> u64 {
        lock_unpoisoned(&self.state).unread.get(conversation)
    }

    pub fn total_unread(&self) -> u64 {
        lock_unpoisoned(&self.state).unread.total()
    }

    pub fn typers(&self, conversation: ConversationKey) -> Vec<TypingSignal> {
        lock_unpoisoned(&self.state)
            .store
            .typers(conversation, Instant::now())
    }

    pub fn reactions(&self, message_id: MessageId) -> Vec<Reaction> {
        lock_unpoisoned(&self.state)
            .store
            .reactions()
            .for_message(message_id)
    }

    pub fn reaction_summary(&self, message_id: MessageId) -> Vec<EmojiSummary> {
        let state = lock_unpoisoned(&self.state);
        state
            .store
            .reactions()
            .summary(message_id, state.store.local_user())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock_unpoisoned(&self.state).notifications.recent()
    }

    pub fn unread_notifications(&self) -> u64 {
        lock_unpoisoned(&self.state).notifications.unread()
    }

    pub fn read_markers(&self, conversation: ConversationKey) -> BTreeMap<UserId, MessageId> {
        lock_unpoisoned(&self.state)
            .read_markers
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        lock_unpoisoned(&self.state).presence.contains(&user_id)
    }

    /// Drops expired typing signals and broadcasts the conversations that changed.
    pub fn sweep_typing(&self) {
        self.sweep_typing_at(Instant::now());
    }

    /// Periodic [`SyncEngine::sweep_typing`]; stops once the engine is dropped.
    pub fn spawn_typing_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    return;
                };
                engine.sweep_typing();
            }
        })
    }

    pub(crate) fn sweep_typing_at(&self, now: Instant) {
        let changes: Vec<EngineEvent> = {
            let mut state = lock_unpoisoned(&self.state);
            let changed = state.store.sweep_typing(now);
            changed
                .into_iter()
                .map(|conversation| state.typing_event(conversation, now))
                .collect()
        };
        self.emit(changes);
    }

    pub(crate) fn send_typing_at(
        &self,
        conversation: ConversationKey,
        is_typing: bool,
        now: Instant,
    ) -> Result<bool, EngineError> {
        {
            let mut state = lock_unpoisoned(&self.state);
            if is_typing {
                let recent = state.last_typing_sent.get(&conversation).is_some_and(|sent| {
                    now.saturating_duration_since(*sent) < self.settings.typing_send_debounce
                });
                if recent {
                    return Ok(false);
                }
                state.last_typing_sent.insert(conversation, now);
            } else {
                state.last_typing_sent.remove(&conversation);
            }
        }
        self.invoke(ClientRequest::SendTyping {
            conversation,
            is_typing,
        })?;
        Ok(true)
    }

    fn send_with_nonce(
        &self,
        conversation: ConversationKey,
        body: String,
        kind: MessageKind,
        media_url: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let client_nonce = Uuid::new_v4();
        self.invoke(ClientRequest::SendMessage {
            conversation,
            client_nonce,
            body,
            kind,
            media_url,
        })?;
        // A sent message ends our own typing signal.
        lock_unpoisoned(&self.state)
            .last_typing_sent
            .remove(&conversation);
        Ok(client_nonce)
    }

    fn invoke(&self, request: ClientRequest) -> Result<(), EngineError> {
        let method = request.method_name();
        self.session.invoke(request).map_err(|err| {
            warn!(method, "hub call rejected: {err}");
            EngineError::Session(err)
        })
    }

    async fn fetch_page(
        &self,
        conversation: ConversationKey,
        page: u32,
    ) -> Result<MergeReport, EngineError> {
        let page_size = self.settings.page_size;
        let messages = self
            .history
            .fetch_messages(conversation, page, page_size)
            .await
            .map_err(|err| {
                warn!(%conversation, page, "history fetch failed: {err}");
                err
            })?;
        let fetched = messages.len();
        let report = lock_unpoisoned(&self.state).store.load_history(
            conversation,
            page,
            page_size,
            messages,
        );
        debug!(
            %conversation,
            page,
            fetched,
            admitted = report.admitted,
            duplicates = report.duplicates,
            "merged history page"
        );
        if report.changed() {
            self.emit(vec![EngineEvent::MessagesChanged { conversation }]);
        }
        Ok(report)
    }

    fn handle_server_event(&self, event: &ServerEvent) {
        debug!(kind = ?event.kind(), conversation = ?event.conversation(), "server event");
        let changes = {
            let mut state = lock_unpoisoned(&self.state);
            apply_server_event(&mut state, event, Instant::now())
        };
        self.emit(changes);
    }

    fn handle_state_change(self: Arc<Self>, connection: ConnectionState) {
        let _ = self
            .events
            .send(EngineEvent::ConnectionStateChanged(connection));
        if connection != ConnectionState::Connected {
            return;
        }

        let (open, resync) = {
            let mut state = lock_unpoisoned(&self.state);
            let resync = state.has_connected;
            state.has_connected = true;
            (state.open.iter().copied().collect::<Vec<_>>(), resync)
        };
        for conversation in &open {
            if let Err(err) = self.session.join(*conversation) {
                warn!(%conversation, "rejoin failed: {err}");
            }
        }
        if !resync || open.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { self.resync(open).await });
            }
            Err(_) => warn!("no runtime available; skipping history resync"),
        }
    }

    /// Refetches the newest page of each conversation after a reconnect.
    async fn resync(&self, conversations: Vec<ConversationKey>) {
        info!(count = conversations.len(), "resyncing open conversations");
        for conversation in conversations {
            if let Err(err) = self.fetch_page(conversation, 1).await {
                warn!(%conversation, "resync failed: {err}");
            }
        }
    }

    fn emit(&self, changes: Vec<EngineEvent>) {
        for change in changes {
            let _ = self.events.send(change);
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for token in lock_unpoisoned(&self.subscriptions).drain(..) {
            self.session.off(token);
        }
    }
}

fn validate_emoji(emoji: &str) -> Result<String, EngineError> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(EngineError::Validation("emoji is empty".into()));
    }
    Ok(emoji.to_string())
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
