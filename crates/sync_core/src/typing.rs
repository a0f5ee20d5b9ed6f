use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use shared::domain::{ConversationKey, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation: ConversationKey,
    pub user_id: UserId,
    pub user_name: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct TypingAggregator {
    window: Duration,
    local_user: UserId,
    by_conversation: HashMap<ConversationKey, HashMap<UserId, TypingSignal>>,
}

impl TypingAggregator {
    pub fn new(window: Duration, local_user: UserId) -> Self {
        Self {
            window,
            local_user,
            by_conversation: HashMap::new(),
        }
    }

    /// Returns `true` when the visible typer set changed.
    pub fn set_typing(
        &mut self,
        conversation: ConversationKey,
        user_id: UserId,
        user_name: &str,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if user_id == self.local_user {
            return false;
        }
        if !is_typing {
            return self.clear_user(conversation, user_id);
        }

        let typers = self.by_conversation.entry(conversation).or_default();
        let was_visible = typers
            .get(&user_id)
            .is_some_and(|signal| signal.expires_at > now);
        typers.insert(
            user_id,
            TypingSignal {
                conversation,
                user_id,
                user_name: user_name.to_string(),
                expires_at: now + self.window,
            },
        );
        !was_visible
    }

    pub fn clear_user(&mut self, conversation: ConversationKey, user_id: UserId) -> bool {
        let Some(typers) = self.by_conversation.get_mut(&conversation) else {
            return false;
        };
        let removed = typers.remove(&user_id).is_some();
        if typers.is_empty() {
            self.by_conversation.remove(&conversation);
        }
        removed
    }

    /// Live typers ordered by name; expired entries are evicted on the way.
    pub fn current_typers(&mut self, conversation: ConversationKey, now: Instant) -> Vec<TypingSignal> {
        let Some(typers) = self.by_conversation.get_mut(&conversation) else {
            return Vec::new();
        };
        typers.retain(|_, signal| signal.expires_at > now);
        let mut live: Vec<TypingSignal> = typers.values().cloned().collect();
        if typers.is_empty() {
            self.by_conversation.remove(&conversation);
        }
        live.sort_by(|a, b| {
            a.user_name
                .cmp(&b.user_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        live
    }

    /// Drops expired signals everywhere; returns the conversations that lost a typer.
    pub fn sweep(&mut self, now: Instant) -> Vec<ConversationKey> {
        let mut changed = Vec::new();
        self.by_conversation.retain(|conversation, typers| {
            let before = typers.len();
            typers.retain(|_, signal| signal.expires_at > now);
            if typers.len() != before {
                changed.push(*conversation);
            }
            !typers.is_empty()
        });
        changed.sort();
        changed
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
