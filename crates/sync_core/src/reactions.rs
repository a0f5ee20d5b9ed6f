use std::collections::{BTreeMap, HashMap};

use shared::domain::{MessageId, Reaction, ReactionAction, UserId};

use crate::error::ApplyConflict;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmojiSummary {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_me: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ReactionTable {
    by_message: HashMap<MessageId, BTreeMap<UserId, Reaction>>,
}

impl ReactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one reaction event. `Ok(true)` when visible state changed.
    pub fn apply(
        &mut self,
        action: ReactionAction,
        reaction: Reaction,
    ) -> Result<bool, ApplyConflict> {
        let message_id = reaction.message_id;
        match action {
            ReactionAction::Added | ReactionAction::Updated => {
                let reactors = self.by_message.entry(message_id).or_default();
                let previous = reactors.insert(reaction.reactor_id, reaction.clone());
                Ok(previous.as_ref() != Some(&reaction))
            }
            ReactionAction::Removed => {
                let Some(reactors) = self.by_message.get_mut(&message_id) else {
                    return Ok(false);
                };
                match reactors.get(&reaction.reactor_id) {
                    None => Ok(false),
                    Some(active) if active.emoji != reaction.emoji => {
                        Err(ApplyConflict::ReactionMismatch {
                            message_id,
                            emoji: reaction.emoji,
                        })
                    }
                    Some(_) => {
                        reactors.remove(&reaction.reactor_id);
                        if reactors.is_empty() {
                            self.by_message.remove(&message_id);
                        }
                        Ok(true)
                    }
                }
            }
        }
    }

    /// Replaces a message's reactions with an authoritative list.
    pub fn replace_all(&mut self, message_id: MessageId, reactions: Vec<Reaction>) {
        let reactors: BTreeMap<UserId, Reaction> = reactions
            .into_iter()
            .filter(|reaction| reaction.message_id == message_id)
            .map(|reaction| (reaction.reactor_id, reaction))
            .collect();
        if reactors.is_empty() {
            self.by_message.remove(&message_id);
        } else {
            self.by_message.insert(message_id, reactors);
        }
    }

    pub fn for_message(&self, message_id: MessageId) -> Vec<Reaction> {
        self.by_message
            .get(&message_id)
            .map(|reactors| reactors.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Grouped view for rendering chips: most used first, ties by emoji.
    pub fn summary(&self, message_id: MessageId, local_user: UserId) -> Vec<EmojiSummary> {
        let Some(reactors) = self.by_message.get(&message_id) else {
            return Vec::new();
        };
        let mut grouped: BTreeMap<&str, EmojiSummary> = BTreeMap::new();
        for reaction in reactors.values() {
            let entry = grouped
                .entry(reaction.emoji.as_str())
                .or_insert_with(|| EmojiSummary {
                    emoji: reaction.emoji.clone(),
                    count: 0,
                    reacted_by_me: false,
                });
            entry.count += 1;
            entry.reacted_by_me |= reaction.reactor_id == local_user;
        }
        let mut summary: Vec<EmojiSummary> = grouped.into_values().collect();
        summary.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
        summary
    }

    /// Number of messages carrying at least one reaction.
    pub fn len(&self) -> usize {
        self.by_message.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_message.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
