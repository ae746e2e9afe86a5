//! Tool registry for managing available tools.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::context::TurnContext;
use crate::llm::ToolDefinition;
use crate::tools::tool::Tool;

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.write().await.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Replaced existing tool registration");
        }
        tracing::debug!("Registered tool: {}", name);
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Get tool definitions for LLM function calling, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run a tool and render the outcome as the text the model sees.
    ///
    /// Never fails: unknown tools and tool errors become descriptive strings.
    pub async fn execute(&self, name: &str, params: serde_json::Value, ctx: &TurnContext) -> String {
        let Some(tool) = self.get(name).await else {
            tracing::warn!(tool = %name, turn_id = %ctx.turn_id, "Model called unknown tool");
            return format!("Unknown tool '{name}'. Nothing was changed.");
        };

        match tool.execute(params, ctx).await {
            Ok(output) => {
                tracing::info!(
                    tool = %name,
                    turn_id = %ctx.turn_id,
                    elapsed_ms = output.duration.as_millis() as u64,
                    "Tool succeeded"
                );
                output.to_model_text()
            }
            Err(e) => {
                tracing::warn!(tool = %name, turn_id = %ctx.turn_id, error = %e, "Tool failed");
                e.to_string()
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
