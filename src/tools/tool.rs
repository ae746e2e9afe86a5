//! The `Tool` trait and its result types.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::TurnContext;

/// Errors a tool reports back to the model.
///
/// These never reach the HTTP client. The registry renders them as the tool
/// result so the model can react in conversation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error(
        "The user is not signed in, so nothing was changed. \
         Let them know they need to sign in to save roadmap changes."
    )]
    NotAuthenticated,

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result of a successful tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }

    /// The result as the string handed back to the model.
    pub fn to_model_text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &TurnContext,
    ) -> Result<ToolOutput, ToolError>;
}
