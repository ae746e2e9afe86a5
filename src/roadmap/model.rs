//! User settings and roadmap data models.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// One unit of the relocation checklist.
///
/// Variant order is the canonical roadmap order; `Ord` follows it, so a
/// `BTreeSet<StepId>` always iterates in roadmap order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepId {
    Profile,
    Visa,
    Cpr,
    Housing,
    Work,
    Health,
}

impl StepId {
    /// All steps in canonical order.
    pub const ALL: [StepId; 6] = [
        StepId::Profile,
        StepId::Visa,
        StepId::Cpr,
        StepId::Housing,
        StepId::Work,
        StepId::Health,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Visa => "visa",
            Self::Cpr => "cpr",
            Self::Housing => "housing",
            Self::Work => "work",
            Self::Health => "health",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown step id '{s}'"))
    }
}

/// Residency status as stored in the profile.
///
/// Unrecognised strings are kept in `Other` so they survive a round trip and
/// can be shown to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResidencyStatus {
    EuCitizen,
    NonEuCitizen,
    Unknown,
    Other(String),
}

impl ResidencyStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EuCitizen => "eu_citizen",
            Self::NonEuCitizen => "non_eu_citizen",
            Self::Unknown => "unknown",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for ResidencyStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "eu_citizen" => Self::EuCitizen,
            "non_eu_citizen" => Self::NonEuCitizen,
            "unknown" => Self::Unknown,
            _ => Self::Other(s),
        }
    }
}

impl From<ResidencyStatus> for String {
    fn from(status: ResidencyStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Occupation status as stored in the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OccupationStatus {
    Student,
    Employed,
    SelfEmployed,
    JobSeeker,
    Other,
    Unrecognized(String),
}

impl OccupationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Student => "student",
            Self::Employed => "employed",
            Self::SelfEmployed => "self_employed",
            Self::JobSeeker => "job_seeker",
            Self::Other => "other",
            Self::Unrecognized(s) => s,
        }
    }
}

impl From<String> for OccupationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "student" => Self::Student,
            "employed" => Self::Employed,
            "self_employed" => Self::SelfEmployed,
            "job_seeker" => Self::JobSeeker,
            "other" => Self::Other,
            _ => Self::Unrecognized(s),
        }
    }
}

impl From<OccupationStatus> for String {
    fn from(status: OccupationStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Manual overrides applied on top of the derived roadmap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapModifications {
    #[serde(default, deserialize_with = "lenient_step_set")]
    pub hidden_step_ids: BTreeSet<StepId>,
}

/// Per-user profile settings.
///
/// Stored as JSON in the `profiles` table. Field names are camelCase on the
/// wire to match the browser client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "non_empty_enum",
        skip_serializing_if = "Option::is_none"
    )]
    pub residency_status: Option<ResidencyStatus>,
    #[serde(
        default,
        deserialize_with = "non_empty_enum",
        skip_serializing_if = "Option::is_none"
    )]
    pub occupation_status: Option<OccupationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_arrived: Option<bool>,
    #[serde(default, deserialize_with = "lenient_step_set")]
    pub completed_steps: BTreeSet<StepId>,
    #[serde(default, deserialize_with = "lenient_modifications")]
    pub roadmap_modifications: RoadmapModifications,
}

impl UserSettings {
    /// Residency is set to something other than "unknown".
    pub fn has_profile(&self) -> bool {
        match &self.residency_status {
            None | Some(ResidencyStatus::Unknown) => false,
            Some(ResidencyStatus::Other(raw)) => !raw.trim().is_empty(),
            Some(_) => true,
        }
    }

    pub fn has_arrived(&self) -> bool {
        self.has_arrived == Some(true)
    }

    pub fn is_completed(&self, id: StepId) -> bool {
        self.completed_steps.contains(&id)
    }

    pub fn is_hidden(&self, id: StepId) -> bool {
        self.roadmap_modifications.hidden_step_ids.contains(&id)
    }

    /// Apply a shallow patch: every field present in the patch replaces the
    /// stored value wholesale. An explicit `null` clears a scalar field.
    pub fn merge(&mut self, patch: SettingsPatch) {
        if let Some(name) = patch.display_name {
            self.display_name = name;
        }
        if let Some(status) = patch.residency_status {
            self.residency_status = status;
        }
        if let Some(status) = patch.occupation_status {
            self.occupation_status = status;
        }
        if let Some(arrived) = patch.has_arrived {
            self.has_arrived = arrived;
        }
        if let Some(steps) = patch.completed_steps {
            self.completed_steps = steps;
        }
        if let Some(modifications) = patch.roadmap_modifications {
            self.roadmap_modifications = modifications;
        }
    }
}

/// Partial settings update. Absent fields are left untouched.
///
/// The scalar fields are doubly optional: an absent key is `None`, while an
/// explicit `null` is `Some(None)` and clears the stored value. A `null`
/// collection is treated as absent; send `[]` to empty it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub residency_status: Option<Option<ResidencyStatus>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub occupation_status: Option<Option<OccupationStatus>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub has_arrived: Option<Option<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<BTreeSet<StepId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roadmap_modifications: Option<RoadmapModifications>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Accept a list of step id strings, dropping ids this build does not know.
/// `null` reads as the empty set.
fn lenient_step_set<'de, D>(deserializer: D) -> Result<BTreeSet<StepId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| {
            let id = value.as_str().and_then(|s| s.parse::<StepId>().ok());
            if id.is_none() {
                tracing::debug!(value = %value, "Dropping unrecognised step id");
            }
            id
        })
        .collect())
}

fn lenient_modifications<'de, D>(deserializer: D) -> Result<RoadmapModifications, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<RoadmapModifications> = Option::deserialize(deserializer)?;
    Ok(raw.unwrap_or_default())
}

/// A key that is present, possibly `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Empty strings count as "not set".
fn non_empty_enum<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: From<String>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(T::from))
}
