//! Persistence gate: the one place that decides whether a turn is stored.

use std::sync::Arc;

use uuid::Uuid;

use crate::store::Database;

/// The user id if it identifies a signed-in user: present and not blank.
///
/// Every guest/authenticated decision in the service goes through here.
pub fn authenticated_user(user_id: Option<&str>) -> Option<&str> {
    user_id.filter(|id| !id.trim().is_empty())
}

/// What the gate did with a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Guest turn; the store was not touched.
    Skipped,
    Saved { chat_id: Uuid },
    /// The write failed. Already logged.
    Failed,
}

/// Writes completed exchanges for signed-in users. Best effort.
#[derive(Clone)]
pub struct PersistenceGate {
    store: Arc<dyn Database>,
}

impl PersistenceGate {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub async fn maybe_persist(
        &self,
        user_id: Option<&str>,
        user_turn: &str,
        assistant_turn: &str,
    ) -> PersistOutcome {
        let Some(user_id) = authenticated_user(user_id) else {
            tracing::debug!("Guest turn, not persisting");
            return PersistOutcome::Skipped;
        };

        match self
            .store
            .save_message_pair(user_id, user_turn, assistant_turn)
            .await
        {
            Ok(chat_id) => {
                tracing::debug!(user_id, chat_id = %chat_id, "Turn persisted");
                PersistOutcome::Saved { chat_id }
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Failed to persist turn");
                PersistOutcome::Failed
            }
        }
    }
}
