use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ConversationMeta;
use crate::core::content::Content;
use crate::core::error::format_api_error;
use crate::core::message::Message;
use crate::utils::url::construct_api_url;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Backend(String),
}

#[derive(Deserialize, Clone, Debug)]
pub struct ConversationWithMessages {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Serialize)]
struct CreateConversationBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Serialize)]
struct EditMessageBody<'a> {
    content: &'a Content,
}

/// Persistence collaborator for conversation records. The engine needs it
/// for the up-front parent conversation in comparison turns and for edit
/// propagation; tests substitute an in-memory implementation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, title: Option<&str>) -> Result<ConversationMeta, StoreError>;
    async fn get(&self, id: &str) -> Result<ConversationWithMessages, StoreError>;
    async fn list(&self) -> Result<Vec<ConversationMeta>, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &Content,
    ) -> Result<(), StoreError>;
}

pub struct HttpConversationStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpConversationStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let url = construct_api_url(&self.base_url, endpoint);
        let mut builder = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        builder
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<no body>".to_string());
    Err(StoreError::Backend(format_api_error(&body)))
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    async fn create(&self, title: Option<&str>) -> Result<ConversationMeta, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "conversations")
            .json(&CreateConversationBody { title })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn get(&self, id: &str) -> Result<ConversationWithMessages, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &format!("conversations/{id}"))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn list(&self) -> Result<Vec<ConversationMeta>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, "conversations")
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("conversations/{id}"))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &Content,
    ) -> Result<(), StoreError> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("conversations/{conversation_id}/messages/{message_id}"),
            )
            .json(&EditMessageBody { content })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
