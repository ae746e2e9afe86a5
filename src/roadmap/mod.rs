//! Relocation roadmap: the user's settings and the checklist derived from them.
//!
//! `model` holds the persisted shapes (`UserSettings`, `SettingsPatch`,
//! `StepId`). `derive` turns settings into the ordered, status-annotated
//! step list the UI renders and the assistant reasons about. `routes` exposes
//! both over HTTP.

pub mod derive;
pub mod model;
pub mod routes;

pub use derive::{RoadmapStep, RoadmapSummary, StepStatus, completion_percent, derive_steps};
pub use model::{
    OccupationStatus, ResidencyStatus, RoadmapModifications, SettingsPatch, StepId, UserSettings,
};
pub use routes::{RoadmapRouteState, roadmap_routes};
