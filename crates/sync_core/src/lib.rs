use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod history;
pub mod notifications;
pub mod reactions;
pub mod session;
pub mod store;
pub mod transport;
pub mod typing;
pub mod unread;

pub use config::{load_settings, OutboundPolicy, ReconnectPolicy, Settings};
pub use engine::{EngineEvent, SyncEngine};
pub use error::{
    ApplyConflict, AuthError, ConnectError, EngineError, HistoryFetchError, SessionError,
    TransportError,
};
pub use history::{HistoryApi, HttpHistoryApi, MissingHistoryApi};
pub use session::{ConnectionSession, ConnectionState, SubscriptionToken};
pub use store::{ConversationStore, LatestPreview, DELETED_PLACEHOLDER};
pub use transport::{Transport, TransportConnection, TransportSink, WsTransport};

/// State behind these mutexes stays consistent across a panicking holder,
/// so poisoning is not propagated.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
