use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use shared::domain::{
    ConversationKey, Message, MessageId, MessageKind, Reaction, ReactionAction, UserId,
};
use tracing::warn;

use crate::{
    dedup::{Admission, LoggedMessage, MessageDeduplicator},
    error::ApplyConflict,
    reactions::ReactionTable,
    typing::{TypingAggregator, TypingSignal},
};

pub const DELETED_PLACEHOLDER: &str = "This message was deleted";
const MEDIA_PREVIEW: &str = "Sent an attachment";
const PREVIEW_MAX_CHARS: usize = 80;
const LOCAL_SENDER_LABEL: &str = "You";

#[derive(Debug, Default)]
pub struct ConversationLog {
    entries: Vec<LoggedMessage>,
    highest_page: u32,
    has_more: bool,
}

impl ConversationLog {
    pub fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn get(&self, message_id: MessageId) -> Option<&Message> {
        self.messages().find(|message| message.id == message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next (older) history page to request; pages are 1-based, newest first.
    pub fn next_page(&self) -> u32 {
        self.highest_page + 1
    }

    /// `false` once a short page has been seen. A log that never loaded
    /// history reports `true`.
    pub fn has_more(&self) -> bool {
        self.highest_page == 0 || self.has_more
    }

    pub fn newest(&self) -> Option<&Message> {
        self.entries.last().map(|entry| &entry.message)
    }

    fn get_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        self.entries
            .iter_mut()
            .map(|entry| &mut entry.message)
            .find(|message| message.id == message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestPreview {
    pub message_id: MessageId,
    pub preview: String,
    pub sender_label: String,
    pub timestamp: DateTime<Utc>,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub admitted: usize,
    pub duplicates: usize,
    /// Duplicates whose history copy carried a newer edit or a deletion.
    pub refreshed: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.admitted > 0 || self.refreshed > 0
    }
}

#[derive(Debug)]
pub struct ConversationStore {
    local_user: UserId,
    dedup: MessageDeduplicator,
    logs: HashMap<ConversationKey, ConversationLog>,
    message_index: HashMap<MessageId, ConversationKey>,
    reactions: ReactionTable,
    typing: TypingAggregator,
}

impl ConversationStore {
    pub fn new(local_user: UserId, typing_window: Duration) -> Self {
        Self {
            local_user,
            dedup: MessageDeduplicator::new(),
            logs: HashMap::new(),
            message_index: HashMap::new(),
            reactions: ReactionTable::new(),
            typing: TypingAggregator::new(typing_window, local_user),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Merges one history page. Messages tagged with another conversation are dropped.
    pub fn load_history(
        &mut self,
        conversation: ConversationKey,
        page: u32,
        page_size: u32,
        messages: Vec<Message>,
    ) -> MergeReport {
        let page_len = messages.len();
        let log = self.logs.entry(conversation).or_default();
        let mut report = MergeReport::default();

        for message in messages {
            if message.conversation != conversation {
                warn!(
                    %conversation,
                    message_id = message.id.0,
                    other = %message.conversation,
                    "history page contained a message from another conversation"
                );
                continue;
            }
            match self.dedup.admit(&message, &log.entries) {
                Admission::Accept {
                    position,
                    arrival_seq,
                } => {
                    self.message_index.insert(message.id, conversation);
                    log.entries.insert(
                        position,
                        LoggedMessage {
                            message,
                            arrival_seq,
                        },
                    );
                    report.admitted += 1;
                }
                Admission::Duplicate { position } => {
                    report.duplicates += 1;
                    if refresh_from_history(&mut log.entries[position].message, &message) {
                        report.refreshed += 1;
                    }
                }
            }
        }

        if page >= log.highest_page {
            log.highest_page = page;
            log.has_more = page_len >= page_size as usize && page_len > 0;
        }
        report
    }

    /// Merges a pushed message, creating the log if needed. `false` for duplicates.
    pub fn admit_live(&mut self, message: Message) -> bool {
        let conversation = message.conversation;
        let id = message.id;
        let log = self.logs.entry(conversation).or_default();
        if self.dedup.merge(message, &mut log.entries) {
            self.message_index.insert(id, conversation);
            true
        } else {
            false
        }
    }

    /// Edits for absent messages, tombstones, or older than the current edit are dropped.
    pub fn apply_edit(
        &mut self,
        conversation: ConversationKey,
        message_id: MessageId,
        new_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), ApplyConflict> {
        let message = self.message_mut(conversation, message_id)?;
        if message.is_deleted() {
            return Err(ApplyConflict::Tombstoned(message_id));
        }
        if message.edited_at.is_some_and(|current| current > edited_at) {
            return Err(ApplyConflict::Stale(message_id));
        }
        message.body = new_body.to_string();
        message.edited_at = Some(edited_at);
        Ok(())
    }

    /// Tombstones a message in place. Repeated deletes are no-ops.
    pub fn apply_delete(
        &mut self,
        conversation: ConversationKey,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, ApplyConflict> {
        let message = self.message_mut(conversation, message_id)?;
        if message.is_deleted() {
            return Ok(false);
        }
        tombstone(message, deleted_at);
        Ok(true)
    }

    /// Reaction events are only accepted for messages this store holds.
    pub fn apply_reaction(
        &mut self,
        conversation: ConversationKey,
        action: ReactionAction,
        reaction: Reaction,
    ) -> Result<bool, ApplyConflict> {
        self.message_mut(conversation, reaction.message_id)?;
        self.reactions.apply(action, reaction)
    }

    pub fn replace_reactions(
        &mut self,
        conversation: ConversationKey,
        message_id: MessageId,
        reactions: Vec<Reaction>,
    ) -> Result<(), ApplyConflict> {
        self.message_mut(conversation, message_id)?;
        self.reactions.replace_all(message_id, reactions);
        Ok(())
    }

    pub fn project_latest(&self, conversation: ConversationKey) -> Option<LatestPreview> {
        project_latest(self.logs.get(&conversation)?, self.local_user)
    }

    pub fn log(&self, conversation: ConversationKey) -> Option<&ConversationLog> {
        self.logs.get(&conversation)
    }

    pub fn messages(&self, conversation: ConversationKey) -> Vec<Message> {
        self.logs
            .get(&conversation)
            .map(|log| log.messages().cloned().collect())
            .unwrap_or_default()
    }

    pub fn conversation_of(&self, message_id: MessageId) -> Option<ConversationKey> {
        self.message_index.get(&message_id).copied()
    }

    pub fn conversations(&self) -> Vec<ConversationKey> {
        let mut keys: Vec<_> = self.logs.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn reactions(&self) -> &ReactionTable {
        &self.reactions
    }

    pub fn set_typing(
        &mut self,
        conversation: ConversationKey,
        user_id: UserId,
        user_name: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        self.typing
            .set_typing(conversation, user_id, user_name, is_typing, now)
    }

    pub fn clear_typing(&mut self, conversation: ConversationKey, user_id: UserId) -> bool {
        self.typing.clear_user(conversation, user_id)
    }

    pub fn typers(&mut self, conversation: ConversationKey, now: Instant) -> Vec<TypingSignal> {
        self.typing.current_typers(conversation, now)
    }

    pub fn sweep_typing(&mut self, now: Instant) -> Vec<ConversationKey> {
        self.typing.sweep(now)
    }

    fn message_mut(
        &mut self,
        conversation: ConversationKey,
        message_id: MessageId,
    ) -> Result<&mut Message, ApplyConflict> {
        self.logs
            .get_mut(&conversation)
            .ok_or(ApplyConflict::UnknownConversation(conversation))?
            .get_mut(message_id)
            .ok_or(ApplyConflict::UnknownMessage {
                conversation,
                message_id,
            })
    }
}

fn tombstone(message: &mut Message, deleted_at: DateTime<Utc>) {
    message.deleted_at = Some(deleted_at);
    message.body = DELETED_PLACEHOLDER.to_string();
    message.media_url = None;
}

/// Applies edit/delete state carried by a re-fetched copy of a known message.
fn refresh_from_history(existing: &mut Message, fetched: &Message) -> bool {
    if existing.is_deleted() {
        return false;
    }
    if let Some(deleted_at) = fetched.deleted_at {
        tombstone(existing, deleted_at);
        return true;
    }
    match (existing.edited_at, fetched.edited_at) {
        (current, Some(fetched_at)) if current.map_or(true, |current| fetched_at > current) => {
            existing.body = fetched.body.clone();
            existing.edited_at = Some(fetched_at);
            true
        }
        _ => false,
    }
}

/// Conversation-list preview: newest live message, else newest tombstone.
pub fn project_latest(log: &ConversationLog, local_user: UserId) -> Option<LatestPreview> {
    let message = log
        .messages()
        .rev()
        .find(|message| !message.is_deleted())
        .or_else(|| log.newest())?;

    let preview = if message.is_deleted() {
        DELETED_PLACEHOLDER.to_string()
    } else if message.kind == MessageKind::Media && message.body.trim().is_empty() {
        MEDIA_PREVIEW.to_string()
    } else {
        truncate_preview(&message.body)
    };

    let sender_label = if message.sender_id == local_user {
        LOCAL_SENDER_LABEL.to_string()
    } else {
        message
            .sender_name
            .clone()
            .unwrap_or_else(|| format!("User {}", message.sender_id.0))
    };

    Some(LatestPreview {
        message_id: message.id,
        preview,
        sender_label,
        timestamp: message.sent_at,
        is_deleted: message.is_deleted(),
    })
}

fn truncate_preview(body: &str) -> String {
    let single_line = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= PREVIEW_MAX_CHARS {
        return single_line;
    }
    let mut truncated: String = single_line.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
