//! `Database` trait: the async persistence interface used by the service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::roadmap::{SettingsPatch, UserSettings};

/// A chat belonging to a user.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub message_count: i64,
}

/// A persisted chat message.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChatMessage {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A knowledge document with its embedding.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Stored settings for a user, or defaults when the user has none.
    async fn get_user_settings(&self, user_id: &str) -> Result<UserSettings, DatabaseError>;

    /// Shallow-merge `patch` into the stored settings, creating the profile
    /// if needed. Returns the merged result.
    async fn update_user_settings(
        &self,
        user_id: &str,
        patch: &SettingsPatch,
    ) -> Result<UserSettings, DatabaseError>;

    /// Read-modify-write of a user's settings as one atomic step. `change`
    /// sees the settings as currently stored and returns the patch to merge;
    /// no other settings write can land in between.
    async fn modify_user_settings(
        &self,
        user_id: &str,
        change: &(dyn for<'u> Fn(&'u UserSettings) -> SettingsPatch + Send + Sync),
    ) -> Result<UserSettings, DatabaseError>;

    // ── Chats ───────────────────────────────────────────────────────

    /// Append a user/assistant exchange to the user's latest chat, starting a
    /// chat if there is none. Returns the chat id.
    async fn save_message_pair(
        &self,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<Uuid, DatabaseError>;

    /// Chats for a user, newest first.
    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>, DatabaseError>;

    /// Messages of one chat in insertion order. `NotFound` if the chat does
    /// not belong to `user_id`.
    async fn list_chat_messages(
        &self,
        user_id: &str,
        chat_id: Uuid,
    ) -> Result<Vec<StoredChatMessage>, DatabaseError>;

    // ── Documents ───────────────────────────────────────────────────

    async fn insert_document(
        &self,
        content: &str,
        metadata: &serde_json::Value,
        embedding: &[f32],
    ) -> Result<Uuid, DatabaseError>;

    async fn list_documents(&self) -> Result<Vec<StoredDocument>, DatabaseError>;

    /// Remove the whole corpus before a re-index. Returns the rows deleted.
    async fn clear_documents(&self) -> Result<u64, DatabaseError>;
}
