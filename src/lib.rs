//! localdesk: a relocation assistant for people moving to Denmark.
//!
//! Streams chat answers from an LLM, grounded in retrieved documentation and
//! the user's profile, and lets the model edit the user's relocation roadmap
//! through a tool.

pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod prompt;
pub mod retrieval;
pub mod roadmap;
pub mod server;
pub mod store;
pub mod tools;

#[cfg(test)]
mod testing;
