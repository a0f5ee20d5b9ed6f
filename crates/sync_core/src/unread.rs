use std::collections::HashMap;

use shared::domain::ConversationKey;

#[derive(Debug, Default, Clone)]
pub struct UnreadTracker {
    counts: HashMap<ConversationKey, u64>,
}

impl UnreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, conversation: ConversationKey) -> u64 {
        let count = self.counts.entry(conversation).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Clamped at zero.
    pub fn decrement(&mut self, conversation: ConversationKey) -> u64 {
        let Some(count) = self.counts.get_mut(&conversation) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(&conversation);
        }
        remaining
    }

    /// Returns the count that was cleared.
    pub fn clear(&mut self, conversation: ConversationKey) -> u64 {
        self.counts.remove(&conversation).unwrap_or(0)
    }

    pub fn clear_all(&mut self) {
        self.counts.clear();
    }

    pub fn get(&self, conversation: ConversationKey) -> u64 {
        self.counts.get(&conversation).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn conversations_with_unread(&self) -> Vec<(ConversationKey, u64)> {
        let mut unread: Vec<_> = self.counts.iter().map(|(k, v)| (*k, *v)).collect();
        unread.sort();
        unread
    }
}
