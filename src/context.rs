//! Per-turn context handed to tools.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::chat::persistence::authenticated_user;

/// Context for one chat turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub turn_id: Uuid,
    /// User id exactly as the client sent it. May be blank.
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl TurnContext {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            user_id,
            started_at: Utc::now(),
        }
    }

    /// Milliseconds since the turn started.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    /// The signed-in user, if any.
    pub fn authenticated_user(&self) -> Option<&str> {
        authenticated_user(self.user_id.as_deref())
    }
}

impl Default for TurnContext {
    fn default() -> Self {
        Self::new(None)
    }
}
