//! Persistence layer: libSQL storage for profiles, chat history and documents.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ChatSummary, Database, StoredChatMessage, StoredDocument};
