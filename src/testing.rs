//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use uuid::Uuid;

use crate::error::{DatabaseError, LlmError};
use crate::llm::{CompletionRequest, CompletionStream, LlmProvider, StreamEvent};
use crate::roadmap::{SettingsPatch, UserSettings};
use crate::store::{ChatSummary, Database, LibSqlBackend, StoredChatMessage, StoredDocument};

/// In-memory store that records every message-pair write.
pub struct RecordingDatabase {
    inner: LibSqlBackend,
    saves: Mutex<Vec<(String, String, String)>>,
    fail_saves: bool,
    read_delay: Option<Duration>,
}

impl RecordingDatabase {
    pub async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            saves: Mutex::new(Vec::new()),
            fail_saves: false,
            read_delay: None,
        }
    }

    /// Same, but every `save_message_pair` call errors after being recorded.
    pub async fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::new().await
        }
    }

    /// Delay every settings read, widening any read-then-write window.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn saved_pairs(&self) -> Vec<(String, String, String)> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for RecordingDatabase {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn get_user_settings(&self, user_id: &str) -> Result<UserSettings, DatabaseError> {
        let settings = self.inner.get_user_settings(user_id).await?;
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(settings)
    }

    async fn update_user_settings(
        &self,
        user_id: &str,
        patch: &SettingsPatch,
    ) -> Result<UserSettings, DatabaseError> {
        self.inner.update_user_settings(user_id, patch).await
    }

    async fn modify_user_settings(
        &self,
        user_id: &str,
        change: &(dyn for<'u> Fn(&'u UserSettings) -> SettingsPatch + Send + Sync),
    ) -> Result<UserSettings, DatabaseError> {
        self.inner.modify_user_settings(user_id, change).await
    }

    async fn save_message_pair(
        &self,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<Uuid, DatabaseError> {
        self.saves.lock().unwrap().push((
            user_id.to_string(),
            user_content.to_string(),
            assistant_content.to_string(),
        ));
        if self.fail_saves {
            return Err(DatabaseError::Query("database is locked".to_string()));
        }
        self.inner
            .save_message_pair(user_id, user_content, assistant_content)
            .await
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>, DatabaseError> {
        self.inner.list_chats(user_id).await
    }

    async fn list_chat_messages(
        &self,
        user_id: &str,
        chat_id: Uuid,
    ) -> Result<Vec<StoredChatMessage>, DatabaseError> {
        self.inner.list_chat_messages(user_id, chat_id).await
    }

    async fn insert_document(
        &self,
        content: &str,
        metadata: &serde_json::Value,
        embedding: &[f32],
    ) -> Result<Uuid, DatabaseError> {
        self.inner.insert_document(content, metadata, embedding).await
    }

    async fn list_documents(&self) -> Result<Vec<StoredDocument>, DatabaseError> {
        self.inner.list_documents().await
    }

    async fn clear_documents(&self) -> Result<u64, DatabaseError> {
        self.inner.clear_documents().await
    }
}

/// One scripted model response.
pub struct Script {
    pub events: Vec<Result<StreamEvent, LlmError>>,
    /// Keep the stream open after the events instead of ending it.
    pub hang: bool,
}

impl Script {
    pub fn events(events: Vec<StreamEvent>) -> Self {
        Self {
            events: events.into_iter().map(Ok).collect(),
            hang: false,
        }
    }

    pub fn then_hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// Model stub that replays scripts in order and records each request.
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: "scripted".to_string(),
                reason: "no scripted response left".to_string(),
            })?;
        let events = futures::stream::iter(script.events);
        if script.hang {
            Ok(events.chain(futures::stream::pending()).boxed())
        } else {
            Ok(events.boxed())
        }
    }
}
