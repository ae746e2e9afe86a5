//! The `/chat` turn: request validation, the model/tool loop and the
//! persistence of completed exchanges.

pub mod orchestrator;
pub mod persistence;
pub mod request;
pub mod routes;

pub use orchestrator::{ActiveTurn, ChatService, DEFAULT_MAX_STEPS, TurnOutcome};
pub use persistence::{PersistOutcome, PersistenceGate, authenticated_user};
pub use request::ChatTurn;
pub use routes::{ChatRouteState, chat_routes};
