//! Roadmap derivation: settings in, ordered step list out.
//!
//! Everything here is pure: no I/O, no clock, no shared state. The UI and the
//! chat layer both call it on every render/request.

use serde::{Deserialize, Serialize};

use super::model::{OccupationStatus, ResidencyStatus, StepId, UserSettings};

/// Status of a step in the derived roadmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Current,
    Upcoming,
    Locked,
}

/// A derived roadmap step, ready to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapStep {
    pub id: StepId,
    pub title: &'static str,
    pub description: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<&'static str>,
}

/// Title/description pair for a step.
struct StepCopy {
    title: &'static str,
    description: &'static str,
}

const PROFILE: StepCopy = StepCopy {
    title: "Set Up Profile",
    description: "Define your residency and occupation status",
};
const VISA: StepCopy = StepCopy {
    title: "Visa & Work Permit",
    description: "Apply for the appropriate visa or work permit",
};
const VISA_EU: StepCopy = StepCopy {
    title: "EU Registration",
    description: "Register with Danish authorities as EU citizen",
};
const CPR: StepCopy = StepCopy {
    title: "CPR Number",
    description: "Get your Danish personal identification number",
};
const HOUSING: StepCopy = StepCopy {
    title: "Find Housing",
    description: "Search for accommodation in Denmark",
};
const WORK: StepCopy = StepCopy {
    title: "Employment",
    description: "Start your job or set up your business",
};
const WORK_STUDENT: StepCopy = StepCopy {
    title: "University Enrollment",
    description: "Complete university registration and SU application",
};
const HEALTH: StepCopy = StepCopy {
    title: "Healthcare & Insurance",
    description: "Register for Danish healthcare system",
};

const REASON_PROFILE: &str = "Complete your profile first";
const REASON_CPR: &str = "Requires CPR number";
const REASON_VISA: &str = "Requires valid visa/work permit";

/// Derive the visible roadmap for `settings`.
///
/// Steps come out in canonical order with hidden steps removed. A single
/// left-to-right pass assigns statuses, so at most one step is `Current`
/// and it is always the first step that is neither locked nor completed.
pub fn derive_steps(settings: &UserSettings) -> Vec<RoadmapStep> {
    let has_profile = settings.has_profile();
    let has_arrived = settings.has_arrived();
    let is_non_eu = settings.residency_status == Some(ResidencyStatus::NonEuCitizen);
    let awaiting_visa = is_non_eu && !has_arrived && !settings.is_completed(StepId::Visa);

    let mut found_current = false;
    let mut steps = Vec::with_capacity(StepId::ALL.len());

    for id in StepId::ALL {
        if settings.is_hidden(id) {
            continue;
        }

        let base_completed = match id {
            StepId::Profile => has_profile,
            StepId::Visa => has_arrived || settings.is_completed(StepId::Visa),
            _ => settings.is_completed(id),
        };

        let locked_reason = match id {
            StepId::Profile => None,
            _ if !has_profile => Some(if id == StepId::Health {
                REASON_CPR
            } else {
                REASON_PROFILE
            }),
            StepId::Work if awaiting_visa => Some(REASON_VISA),
            _ => None,
        };

        let status = if locked_reason.is_some() {
            StepStatus::Locked
        } else if base_completed || settings.is_completed(id) {
            StepStatus::Completed
        } else if !found_current {
            found_current = true;
            StepStatus::Current
        } else {
            StepStatus::Upcoming
        };

        let copy = step_copy(id, settings);
        steps.push(RoadmapStep {
            id,
            title: copy.title,
            description: copy.description,
            status,
            locked_reason,
        });
    }

    steps
}

/// Presentation copy. Never influences status.
fn step_copy(id: StepId, settings: &UserSettings) -> &'static StepCopy {
    match id {
        StepId::Profile => &PROFILE,
        StepId::Visa if settings.residency_status == Some(ResidencyStatus::EuCitizen) => &VISA_EU,
        StepId::Visa => &VISA,
        StepId::Cpr => &CPR,
        StepId::Housing => &HOUSING,
        StepId::Work if settings.occupation_status == Some(OccupationStatus::Student) => {
            &WORK_STUDENT
        }
        StepId::Work => &WORK,
        StepId::Health => &HEALTH,
    }
}

/// Percentage of visible steps that are completed, rounded half up.
/// An empty roadmap is 0%.
pub fn completion_percent(steps: &[RoadmapStep]) -> u8 {
    let total = steps.len();
    if total == 0 {
        return 0;
    }
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    ((200 * completed + total) / (2 * total)) as u8
}

/// Derived roadmap plus progress counters, as served to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapSummary {
    pub steps: Vec<RoadmapStep>,
    pub completed_count: usize,
    pub total_steps: usize,
    pub completion_percent: u8,
}

impl RoadmapSummary {
    pub fn from_settings(settings: &UserSettings) -> Self {
        let steps = derive_steps(settings);
        let completed_count = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let completion_percent = completion_percent(&steps);
        Self {
            total_steps: steps.len(),
            completed_count,
            completion_percent,
            steps,
        }
    }

    /// The step the user should work on next, if any.
    pub fn current(&self) -> Option<&RoadmapStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Current)
    }
}
