//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared; read-modify-write sequences are serialized by `write_lock`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::roadmap::{SettingsPatch, UserSettings};
use crate::store::migrations;
use crate::store::traits::{ChatSummary, Database, StoredChatMessage, StoredDocument};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Raw settings object for a user, unknown keys included.
    async fn profile_metadata(&self, user_id: &str) -> Result<Option<Map<String, Value>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT metadata FROM profiles WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("profile_metadata: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row.get(0).unwrap_or_else(|_| "{}".to_string());
                match serde_json::from_str::<Value>(&raw) {
                    Ok(Value::Object(map)) => Ok(Some(map)),
                    Ok(_) | Err(_) => {
                        warn!(user_id, "Profile metadata is not a JSON object, treating as empty");
                        Ok(Some(Map::new()))
                    }
                }
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("profile_metadata: {e}"))),
        }
    }

    async fn latest_chat(&self, user_id: &str) -> Result<Option<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM chats WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_chat: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("latest_chat: {e}")))?;
                Ok(Uuid::parse_str(&id).ok())
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_chat: {e}"))),
        }
    }

    /// Merge `patch` into the stored object and upsert it. Callers hold
    /// `write_lock`.
    async fn write_patch(
        &self,
        user_id: &str,
        mut metadata: Map<String, Value>,
        patch: &SettingsPatch,
    ) -> Result<UserSettings, DatabaseError> {
        let patch_value =
            serde_json::to_value(patch).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        if let Value::Object(fields) = patch_value {
            // Shallow merge: present top-level keys replace stored ones.
            metadata.extend(fields);
        }

        let raw = serde_json::to_string(&metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO profiles (user_id, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (user_id) DO UPDATE SET metadata = ?2, updated_at = ?3",
                params![user_id, raw, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_user_settings: {e}")))?;

        debug!(user_id, "Settings updated");
        Ok(settings_from_metadata(user_id, metadata))
    }

    /// Create a chat and append both messages. Runs inside the caller's
    /// transaction.
    async fn append_pair(
        conn: &Connection,
        existing: Option<Uuid>,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<Uuid, DatabaseError> {
        let chat_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4();
                conn.execute(
                    "INSERT INTO chats (id, user_id, created_at) VALUES (?1, ?2, ?3)",
                    params![id.to_string(), user_id, Utc::now().to_rfc3339()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("create_chat: {e}")))?;
                debug!(user_id, chat_id = %id, "Chat created");
                id
            }
        };
        insert_message(conn, chat_id, "user", user_content).await?;
        insert_message(conn, chat_id, "assistant", assistant_content).await?;
        Ok(chat_id)
    }
}

async fn insert_message(
    conn: &Connection,
    chat_id: Uuid,
    role: &str,
    content: &str,
) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO messages (id, chat_id, role, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![Uuid::new_v4().to_string(), chat_id.to_string(), role, content, now],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;
    Ok(())
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Decode stored settings. A stored shape this build cannot read degrades to
/// defaults rather than failing the caller.
fn settings_from_metadata(user_id: &str, metadata: Map<String, Value>) -> UserSettings {
    serde_json::from_value(Value::Object(metadata)).unwrap_or_else(|e| {
        warn!(user_id, error = %e, "Stored settings unreadable, using defaults");
        UserSettings::default()
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_user_settings(&self, user_id: &str) -> Result<UserSettings, DatabaseError> {
        Ok(match self.profile_metadata(user_id).await? {
            Some(metadata) => settings_from_metadata(user_id, metadata),
            None => UserSettings::default(),
        })
    }

    async fn update_user_settings(
        &self,
        user_id: &str,
        patch: &SettingsPatch,
    ) -> Result<UserSettings, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let metadata = self.profile_metadata(user_id).await?.unwrap_or_default();
        self.write_patch(user_id, metadata, patch).await
    }

    async fn modify_user_settings(
        &self,
        user_id: &str,
        change: &(dyn for<'u> Fn(&'u UserSettings) -> SettingsPatch + Send + Sync),
    ) -> Result<UserSettings, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let metadata = self.profile_metadata(user_id).await?.unwrap_or_default();
        let current = settings_from_metadata(user_id, metadata.clone());
        let patch = change(&current);
        self.write_patch(user_id, metadata, &patch).await
    }

    // ── Chats ───────────────────────────────────────────────────────

    async fn save_message_pair(
        &self,
        user_id: &str,
        user_content: &str,
        assistant_content: &str,
    ) -> Result<Uuid, DatabaseError> {
        let _guard = self.write_lock.lock().await;

        let existing = self.latest_chat(user_id).await?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_message_pair: {e}")))?;
        match Self::append_pair(&tx, existing, user_id, user_content, assistant_content).await {
            Ok(chat_id) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("save_message_pair commit: {e}")))?;
                Ok(chat_id)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(user_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT c.id, c.created_at, COUNT(m.id)
                 FROM chats c LEFT JOIN messages m ON m.chat_id = c.id
                 WHERE c.user_id = ?1
                 GROUP BY c.id
                 ORDER BY c.created_at DESC, c.rowid DESC",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_chats: {e}")))?;

        let mut chats = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let created_str: String = row.get(1).unwrap_or_default();
            chats.push(ChatSummary {
                id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
                created_at: parse_datetime(&created_str),
                message_count: row.get(2).unwrap_or(0),
            });
        }
        Ok(chats)
    }

    async fn list_chat_messages(
        &self,
        user_id: &str,
        chat_id: Uuid,
    ) -> Result<Vec<StoredChatMessage>, DatabaseError> {
        let conn = self.conn();
        let mut owner = conn
            .query(
                "SELECT 1 FROM chats WHERE id = ?1 AND user_id = ?2",
                params![chat_id.to_string(), user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_chat_messages: {e}")))?;
        if !matches!(owner.next().await, Ok(Some(_))) {
            return Err(DatabaseError::NotFound {
                entity: "chat".to_string(),
                id: chat_id.to_string(),
            });
        }

        let mut rows = conn
            .query(
                "SELECT id, role, content, created_at FROM messages
                 WHERE chat_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![chat_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_chat_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let created_str: String = row.get(3).unwrap_or_default();
            messages.push(StoredChatMessage {
                id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
                role: row.get(1).unwrap_or_default(),
                content: row.get(2).unwrap_or_default(),
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(messages)
    }

    // ── Documents ───────────────────────────────────────────────────

    async fn insert_document(
        &self,
        content: &str,
        metadata: &Value,
        embedding: &[f32],
    ) -> Result<Uuid, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let id = Uuid::new_v4();
        let metadata = serde_json::to_string(metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let embedding = serde_json::to_string(embedding)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO documents (id, content, metadata, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), content, metadata, embedding, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_document: {e}")))?;
        Ok(id)
    }

    async fn list_documents(&self) -> Result<Vec<StoredDocument>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, content, metadata, embedding FROM documents ORDER BY rowid ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_documents: {e}")))?;

        let mut documents = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).unwrap_or_default();
            let metadata: String = row.get(2).unwrap_or_else(|_| "{}".to_string());
            let embedding: String = row.get(3).unwrap_or_default();
            let Ok(embedding) = serde_json::from_str::<Vec<f32>>(&embedding) else {
                warn!(document_id = %id, "Skipping document with unreadable embedding");
                continue;
            };
            documents.push(StoredDocument {
                id,
                content: row.get(1).unwrap_or_default(),
                metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
                embedding,
            });
        }
        Ok(documents)
    }

    async fn clear_documents(&self) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute("DELETE FROM documents", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_documents: {e}")))
    }
}
