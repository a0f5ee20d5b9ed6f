use std::sync::RwLock;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use shared::{
    domain::{ConversationKey, Message, MessageId, Reaction},
    error::ApiError,
};
use tracing::debug;
use url::Url;

use crate::error::HistoryFetchError;

#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Page `page` (1-based, newest first) of a conversation's history.
    async fn fetch_messages(
        &self,
        conversation: ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, HistoryFetchError>;

    async fn fetch_reactions(&self, message_id: MessageId)
        -> Result<Vec<Reaction>, HistoryFetchError>;
}

/// Stand-in used when the engine is built without a history backend.
pub struct MissingHistoryApi;

#[async_trait]
impl HistoryApi for MissingHistoryApi {
    async fn fetch_messages(
        &self,
        conversation: ConversationKey,
        _page: u32,
        _page_size: u32,
    ) -> Result<Vec<Message>, HistoryFetchError> {
        Err(HistoryFetchError::Unavailable(format!(
            "no history backend configured for {conversation}"
        )))
    }

    async fn fetch_reactions(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Reaction>, HistoryFetchError> {
        Err(HistoryFetchError::Unavailable(format!(
            "no history backend configured for reactions of {message_id}"
        )))
    }
}

pub struct HttpHistoryApi {
    http: Client,
    base_url: Url,
    credential: RwLock<Option<String>>,
}

impl HttpHistoryApi {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: Client::new(),
            base_url,
            credential: RwLock::new(None),
        }
    }

    pub fn new_with_credential(base_url: Url, credential: impl Into<String>) -> Self {
        let api = Self::new(base_url);
        api.set_credential(credential);
        api
    }

    pub fn set_credential(&self, credential: impl Into<String>) {
        let mut guard = self
            .credential
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(credential.into());
    }

    fn endpoint(&self, path: &str) -> Result<Url, HistoryFetchError> {
        Ok(self.base_url.join(path)?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, HistoryFetchError> {
        let credential = self
            .credential
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let mut request = self.http.get(url.clone()).query(query);
        if let Some(credential) = credential {
            request = request.bearer_auth(credential);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(HistoryFetchError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|err| err.message)
                .unwrap_or(body);
            return Err(HistoryFetchError::Status {
                status: status.as_u16(),
                message,
            });
        }
        debug!(%url, status = status.as_u16(), "history request completed");
        Ok(response.json().await?)
    }
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn fetch_messages(
        &self,
        conversation: ConversationKey,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, HistoryFetchError> {
        let url = self.endpoint(&format!("conversations/{conversation}/messages"))?;
        self.get_json(
            url,
            &[("page", page.to_string()), ("page_size", page_size.to_string())],
        )
        .await
    }

    async fn fetch_reactions(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Reaction>, HistoryFetchError> {
        let url = self.endpoint(&format!("messages/{message_id}/reactions"))?;
        self.get_json(url, &[]).await
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
