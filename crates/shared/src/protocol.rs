use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{
        ConversationKey, Message, MessageId, MessageKind, Notification, Reaction, ReactionAction,
        UserId,
    },
    error::ApiError,
};

/// Outbound calls invoked on the realtime hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        conversation: ConversationKey,
    },
    LeaveConversation {
        conversation: ConversationKey,
    },
    SendMessage {
        conversation: ConversationKey,
        client_nonce: Uuid,
        body: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
    },
    SendTyping {
        conversation: ConversationKey,
        is_typing: bool,
    },
    React {
        conversation: ConversationKey,
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        conversation: ConversationKey,
        message_id: MessageId,
        emoji: String,
    },
    EditMessage {
        conversation: ConversationKey,
        message_id: MessageId,
        body: String,
    },
    DeleteMessage {
        conversation: ConversationKey,
        message_id: MessageId,
    },
    MarkRead {
        conversation: ConversationKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<MessageId>,
    },
    MarkAllNotificationsRead,
}

impl ClientRequest {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::SendTyping { .. } => "send_typing",
            Self::React { .. } => "react",
            Self::RemoveReaction { .. } => "remove_reaction",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::MarkRead { .. } => "mark_read",
            Self::MarkAllNotificationsRead => "mark_all_notifications_read",
        }
    }
}

/// Named push events delivered by the realtime hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: Message,
    },
    GroupMessageReceived {
        message: Message,
    },
    ReactionChanged {
        conversation: ConversationKey,
        action: ReactionAction,
        reaction: Reaction,
    },
    MessageEdited {
        conversation: ConversationKey,
        message_id: MessageId,
        body: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation: ConversationKey,
        message_id: MessageId,
        deleted_at: DateTime<Utc>,
    },
    TypingChanged {
        conversation: ConversationKey,
        user_id: UserId,
        #[serde(default)]
        user_name: String,
        is_typing: bool,
    },
    ReadReceipt {
        conversation: ConversationKey,
        reader_id: UserId,
        last_read: MessageId,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
    },
    NotificationReceived {
        notification: Notification,
    },
    Error(ApiError),
}

/// Discriminant of [`ServerEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    GroupMessageReceived,
    ReactionChanged,
    MessageEdited,
    MessageDeleted,
    TypingChanged,
    ReadReceipt,
    PresenceChanged,
    NotificationReceived,
    Error,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::GroupMessageReceived => "group_message_received",
            Self::ReactionChanged => "reaction_changed",
            Self::MessageEdited => "message_edited",
            Self::MessageDeleted => "message_deleted",
            Self::TypingChanged => "typing_changed",
            Self::ReadReceipt => "read_receipt",
            Self::PresenceChanged => "presence_changed",
            Self::NotificationReceived => "notification_received",
            Self::Error => "error",
        }
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::GroupMessageReceived { .. } => EventKind::GroupMessageReceived,
            Self::ReactionChanged { .. } => EventKind::ReactionChanged,
            Self::MessageEdited { .. } => EventKind::MessageEdited,
            Self::MessageDeleted { .. } => EventKind::MessageDeleted,
            Self::TypingChanged { .. } => EventKind::TypingChanged,
            Self::ReadReceipt { .. } => EventKind::ReadReceipt,
            Self::PresenceChanged { .. } => EventKind::PresenceChanged,
            Self::NotificationReceived { .. } => EventKind::NotificationReceived,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Conversation the event belongs to, if it is conversation scoped.
    pub fn conversation(&self) -> Option<ConversationKey> {
        match self {
            Self::MessageReceived { message } | Self::GroupMessageReceived { message } => {
                Some(message.conversation)
            }
            Self::ReactionChanged { conversation, .. }
            | Self::MessageEdited { conversation, .. }
            | Self::MessageDeleted { conversation, .. }
            | Self::TypingChanged { conversation, .. }
            | Self::ReadReceipt { conversation, .. } => Some(*conversation),
            Self::PresenceChanged { .. } | Self::NotificationReceived { .. } | Self::Error(_) => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GroupId;

    #[test]
    fn server_events_use_tagged_snake_case_envelope() {
        let event = ServerEvent::PresenceChanged {
            user_id: UserId(4),
            online: true,
        };
        let raw = serde_json::to_value(&event).expect("serialize");
        assert_eq!(raw["type"], "presence_changed");
        assert_eq!(raw["payload"]["user_id"], 4);
    }

    #[test]
    fn decodes_group_message_with_string_conversation_key() {
        let raw = r#"{
            "type": "group_message_received",
            "payload": {
                "message": {
                    "id": 9,
                    "conversation": "group:3",
                    "sender_id": 5,
                    "body": "hi all",
                    "sent_at": "2024-01-01T00:00:00Z"
                }
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).expect("decode");
        assert_eq!(event.kind(), EventKind::GroupMessageReceived);
        assert_eq!(event.conversation(), Some(ConversationKey::Group(GroupId(3))));
    }
}
