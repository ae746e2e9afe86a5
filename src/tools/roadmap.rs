//! `modifyRoadmap`: lets the assistant hide, show and complete roadmap steps.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::context::TurnContext;
use crate::roadmap::{RoadmapModifications, RoadmapSummary, SettingsPatch, StepId, UserSettings};
use crate::store::Database;
use crate::tools::tool::{Tool, ToolError, ToolOutput};

pub const TOOL_NAME: &str = "modifyRoadmap";

/// A validated roadmap change. Each variant carries exactly what it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoadmapAction {
    Hide(StepId),
    Show(StepId),
    /// Show exactly these steps; every other step becomes hidden.
    SetVisible(BTreeSet<StepId>),
    MarkComplete(StepId),
    MarkIncomplete(StepId),
}

/// Arguments as the model sends them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInvocation {
    action: Option<String>,
    step_id: Option<String>,
    visible_steps: Option<Vec<String>>,
}

fn parse_step(raw: &str) -> Result<StepId, ToolError> {
    raw.parse::<StepId>().map_err(|_| {
        ToolError::InvalidParameters(format!(
            "unknown step '{raw}'. Valid steps are: {}",
            StepId::ALL.map(|id| id.as_str()).join(", ")
        ))
    })
}

impl RoadmapAction {
    /// Validate raw tool arguments.
    pub fn parse(params: &serde_json::Value) -> Result<Self, ToolError> {
        if let serde_json::Value::String(raw) = params {
            return Err(ToolError::InvalidParameters(format!(
                "arguments must be a JSON object, got unparseable text: {raw}"
            )));
        }
        let raw: RawInvocation = serde_json::from_value(params.clone())
            .map_err(|e| ToolError::InvalidParameters(format!("malformed arguments: {e}")))?;

        let action = raw.action.as_deref().ok_or_else(|| {
            ToolError::InvalidParameters(
                "missing 'action'. Use one of hide, show, set_visible, mark_complete, mark_incomplete"
                    .to_string(),
            )
        })?;

        let step = |action: &str| -> Result<StepId, ToolError> {
            let raw_step = raw.step_id.as_deref().ok_or_else(|| {
                ToolError::InvalidParameters(format!("action '{action}' requires 'stepId'"))
            })?;
            parse_step(raw_step)
        };

        match action {
            "hide" => Ok(Self::Hide(step(action)?)),
            "show" => Ok(Self::Show(step(action)?)),
            "mark_complete" => Ok(Self::MarkComplete(step(action)?)),
            "mark_incomplete" => Ok(Self::MarkIncomplete(step(action)?)),
            "set_visible" => {
                let visible = raw.visible_steps.as_ref().ok_or_else(|| {
                    ToolError::InvalidParameters(
                        "action 'set_visible' requires 'visibleSteps'".to_string(),
                    )
                })?;
                let steps = visible
                    .iter()
                    .map(|s| parse_step(s))
                    .collect::<Result<BTreeSet<_>, _>>()?;
                Ok(Self::SetVisible(steps))
            }
            other => Err(ToolError::InvalidParameters(format!(
                "unknown action '{other}'. Use one of hide, show, set_visible, mark_complete, mark_incomplete"
            ))),
        }
    }

    /// The settings change this action makes against `current`.
    ///
    /// Each patch replaces one whole field, computed from the current value.
    pub fn apply(&self, current: &UserSettings) -> SettingsPatch {
        let mut hidden = current.roadmap_modifications.hidden_step_ids.clone();
        let mut completed = current.completed_steps.clone();
        match self {
            Self::Hide(id) => {
                hidden.insert(*id);
            }
            Self::Show(id) => {
                hidden.remove(id);
            }
            Self::SetVisible(visible) => {
                hidden = StepId::ALL
                    .into_iter()
                    .filter(|id| !visible.contains(id))
                    .collect();
            }
            Self::MarkComplete(id) => {
                completed.insert(*id);
            }
            Self::MarkIncomplete(id) => {
                completed.remove(id);
            }
        }

        match self {
            Self::Hide(_) | Self::Show(_) | Self::SetVisible(_) => SettingsPatch {
                roadmap_modifications: Some(RoadmapModifications {
                    hidden_step_ids: hidden,
                }),
                ..Default::default()
            },
            Self::MarkComplete(_) | Self::MarkIncomplete(_) => SettingsPatch {
                completed_steps: Some(completed),
                ..Default::default()
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Hide(id) => format!("Hid the '{id}' step from the roadmap."),
            Self::Show(id) => format!("The '{id}' step is now shown on the roadmap."),
            Self::SetVisible(visible) if visible.is_empty() => {
                "All roadmap steps are now hidden.".to_string()
            }
            Self::SetVisible(visible) => format!(
                "The roadmap now shows only: {}.",
                visible
                    .iter()
                    .map(StepId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Self::MarkComplete(id) => format!("Marked '{id}' as complete."),
            Self::MarkIncomplete(id) => format!("Marked '{id}' as not complete."),
        }
    }
}

/// Tool that edits the signed-in user's roadmap.
pub struct ModifyRoadmapTool {
    store: Arc<dyn Database>,
}

impl ModifyRoadmapTool {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ModifyRoadmapTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Modify the user's relocation roadmap. Hide or show a step, set exactly which \
         steps are visible, or mark a step complete or incomplete. Only use this when \
         the user asks for a change or tells you they finished a step."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let steps: Vec<&str> = StepId::ALL.iter().map(StepId::as_str).collect();
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["hide", "show", "set_visible", "mark_complete", "mark_incomplete"],
                    "description": "The change to make"
                },
                "stepId": {
                    "type": "string",
                    "enum": steps,
                    "description": "The step to change (required for hide, show, mark_complete, mark_incomplete)"
                },
                "visibleSteps": {
                    "type": "array",
                    "items": { "type": "string", "enum": steps },
                    "description": "For set_visible: the steps to show. All other steps are hidden."
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &TurnContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let user_id = ctx.authenticated_user().ok_or(ToolError::NotAuthenticated)?;
        let action = RoadmapAction::parse(&params)?;

        let updated = self
            .store
            .modify_user_settings(user_id, &|current: &UserSettings| action.apply(current))
            .await
            .map_err(|e| {
                ToolError::ExecutionFailed(format!("could not update the roadmap: {e}"))
            })?;

        tracing::info!(user_id, turn_id = %ctx.turn_id, action = ?action, "Roadmap modified");

        let summary = RoadmapSummary::from_settings(&updated);
        let message = format!(
            "{} Progress: {} of {} visible steps complete ({}%).",
            action.describe(),
            summary.completed_count,
            summary.total_steps,
            summary.completion_percent
        );
        Ok(ToolOutput::text(message, start.elapsed()))
    }
}
