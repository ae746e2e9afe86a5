//! System prompt composition for the relocation assistant.

use crate::roadmap::{OccupationStatus, ResidencyStatus, StepId, UserSettings};

const PERSONA: &str = "\
You are an expert Danish consultant specializing in helping expats navigate Danish bureaucracy.

Your expertise covers:
- SKAT (Danish Tax Authority): Registration, tax cards, annual returns
- Visas and Permits: Work permits, residence permits, documentation
- Housing: Rental market, contracts, tenant rights, finding apartments
- CPR: Registering your address and getting a personal identification number
- Healthcare: The yellow health card, choosing a GP, insurance

Guidelines:
1. Provide accurate, actionable information about Danish procedures
2. Be warm and supportive - moving to a new country is challenging
3. If you don't know something, admit it and suggest official resources
4. Stay focused on Denmark-related topics
5. If asked about unrelated topics, politely redirect to Danish bureaucracy matters
6. Use the user's context below to tailor your advice to their situation

Tone: Professional yet friendly, like a knowledgeable local helping a newcomer.";

const TOOL_INSTRUCTIONS: &str = "\
ROADMAP TOOL:
The user has a relocation roadmap with these steps: profile, visa, cpr, housing, work, health.
You can change it with the modifyRoadmap tool:
- action \"hide\" / \"show\" with a stepId to remove or restore a step
- action \"set_visible\" with visibleSteps to show exactly those steps and hide the rest
- action \"mark_complete\" / \"mark_incomplete\" with a stepId to update progress
Only modify the roadmap when the user asks for it or clearly tells you a step is done. \
Confirm the change to the user in your reply.";

fn residency_label(status: &ResidencyStatus) -> &str {
    match status {
        ResidencyStatus::EuCitizen => "EU/EEA citizen",
        ResidencyStatus::NonEuCitizen => "Non-EU citizen",
        ResidencyStatus::Unknown => "Not sure yet",
        ResidencyStatus::Other(raw) => raw,
    }
}

fn occupation_label(status: &OccupationStatus) -> &str {
    match status {
        OccupationStatus::Student => "Student",
        OccupationStatus::Employed => "Employed",
        OccupationStatus::SelfEmployed => "Self-employed",
        OccupationStatus::JobSeeker => "Job seeker",
        OccupationStatus::Other => "Other",
        OccupationStatus::Unrecognized(raw) => raw,
    }
}

fn join_steps<'a>(ids: impl IntoIterator<Item = &'a StepId>) -> String {
    ids.into_iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Render the USER CONTEXT block, or `None` when nothing is known about the user.
fn user_context(settings: &UserSettings) -> Option<String> {
    let has_any = settings.display_name.is_some()
        || settings.residency_status.is_some()
        || settings.occupation_status.is_some()
        || settings.has_arrived.is_some()
        || !settings.completed_steps.is_empty();
    if !has_any {
        return None;
    }

    let mut lines = vec!["USER CONTEXT:".to_string()];
    if let Some(name) = &settings.display_name {
        lines.push(format!("- Name: {name}"));
    }
    if let Some(status) = &settings.residency_status {
        lines.push(format!("- Residency status: {}", residency_label(status)));
    }
    if let Some(status) = &settings.occupation_status {
        lines.push(format!("- Occupation: {}", occupation_label(status)));
    }
    if let Some(arrived) = settings.has_arrived {
        let answer = if arrived { "Yes" } else { "No" };
        lines.push(format!("- Arrived in Denmark: {answer}"));
    }
    if !settings.completed_steps.is_empty() {
        lines.push(format!(
            "- Completed roadmap steps: {}",
            join_steps(&settings.completed_steps)
        ));
    }
    let hidden = &settings.roadmap_modifications.hidden_step_ids;
    if !hidden.is_empty() {
        lines.push(format!("- Hidden roadmap steps: {}", join_steps(hidden)));
    }
    Some(lines.join("\n"))
}

/// Build the system prompt for a chat turn.
///
/// Pure: the same docs and settings always yield the same string. The user
/// context and documentation blocks are only present when there is something
/// to put in them.
pub fn build_system_prompt(retrieved_docs: Option<&str>, settings: Option<&UserSettings>) -> String {
    let mut prompt = format!("{PERSONA}\n\n{TOOL_INSTRUCTIONS}");

    if let Some(context) = settings.and_then(user_context) {
        prompt.push_str("\n\n");
        prompt.push_str(&context);
    }

    if let Some(docs) = retrieved_docs.map(str::trim).filter(|d| !d.is_empty()) {
        prompt.push_str("\n\nRELEVANT DOCUMENTATION:\n");
        prompt.push_str(docs);
        prompt.push_str(
            "\n\nUse the documentation above when it answers the question. \
             If it does not, rely on your general knowledge and say so.",
        );
    }

    prompt
}
