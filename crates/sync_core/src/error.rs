use shared::domain::{ConversationKey, MessageId};
use thiserror::Error;

use crate::session::ConnectionState;

/// Connect, send or stream failure on the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid transport url '{0}'")]
    InvalidUrl(String),
    #[error("failed to connect transport: {0}")]
    Connect(String),
    #[error("failed to send on transport: {0}")]
    Send(String),
    #[error("transport stream failed: {0}")]
    Stream(String),
    #[error("transport closed")]
    Closed,
}

/// Credential rejected by the backend. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("credential rejected: {reason}")]
pub struct AuthError {
    pub reason: String,
}

/// Result of a transport connect attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum HistoryFetchError {
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("history endpoint rejected credential (status {status})")]
    Unauthorized { status: u16 },
    #[error("history endpoint returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid history url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("history backend unavailable: {0}")]
    Unavailable(String),
}

/// A live event referenced state this client does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyConflict {
    #[error("conversation {0} is not loaded")]
    UnknownConversation(ConversationKey),
    #[error("message {message_id} is not present in conversation {conversation}")]
    UnknownMessage {
        conversation: ConversationKey,
        message_id: MessageId,
    },
    #[error("message {0} is tombstoned")]
    Tombstoned(MessageId),
    #[error("stale update for message {0}")]
    Stale(MessageId),
    #[error("removal of '{emoji}' does not match the active reaction on message {message_id}")]
    ReactionMismatch { message_id: MessageId, emoji: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not connected (state: {state:?})")]
    NotConnected { state: ConnectionState },
    #[error("connection failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connect attempt superseded by a later connect or disconnect")]
    Cancelled,
}

impl From<ConnectError> for SessionError {
    fn from(value: ConnectError) -> Self {
        match value {
            ConnectError::Auth(err) => Self::Auth(err),
            ConnectError::Transport(err) => Self::Transport(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    History(#[from] HistoryFetchError),
    #[error("invalid request: {0}")]
    Validation(String),
}
