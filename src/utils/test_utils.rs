use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::models::ModelRegistry;
use crate::api::ConversationMeta;
use crate::core::content::Content;
use crate::core::conversations::{ConversationStore, ConversationWithMessages, StoreError};
use crate::core::orchestrator::{EngineSettings, Orchestrator};

/// Conversation store that never touches the network; create hands out
/// sequential `conv-N` ids.
#[derive(Default)]
pub struct MemoryStore {
    counter: AtomicU64,
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self, title: Option<&str>) -> Result<ConversationMeta, StoreError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ConversationMeta {
            id: format!("conv-{n}"),
            title: title.map(str::to_string),
            created_at: None,
        })
    }

    async fn get(&self, id: &str) -> Result<ConversationWithMessages, StoreError> {
        Err(StoreError::Backend(format!("no such conversation: {id}")))
    }

    async fn list(&self) -> Result<Vec<ConversationMeta>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn edit_message(
        &self,
        _conversation_id: &str,
        _message_id: &str,
        _content: &Content,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

pub fn test_settings(comparison_models: &[&str]) -> EngineSettings {
    EngineSettings {
        model: "acme::alpha".to_string(),
        comparison_models: comparison_models.iter().map(|s| s.to_string()).collect(),
        tools_enabled: false,
        tools: Vec::new(),
        reasoning_effort: None,
        system_prompt: None,
    }
}

/// Engine wired to an in-memory store. Tests drive it by applying stream
/// messages directly; dispatch commands are simply never executed, so no
/// request leaves the process.
pub fn create_test_engine(comparison_models: &[&str]) -> Orchestrator {
    Orchestrator::new(
        "http://backend.test/api",
        "",
        ModelRegistry::default(),
        test_settings(comparison_models),
        Arc::new(MemoryStore::default()),
    )
}
