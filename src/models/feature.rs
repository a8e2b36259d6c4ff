use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The scope that owns a set of work units sharing one dependency graph and
/// one event stream.
///
/// A feature is created once at planning time with its full unit set; units
/// are never added to or removed from an existing feature. Accepting a
/// feature requires every owned unit to be `done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Input for planning a new feature with its complete unit set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFeatureInput {
    pub title: String,
    pub units: Vec<PlanUnitInput>,
}

/// One unit in a feature plan.
///
/// Units reference each other by `key` (unique within the plan); the store
/// assigns real ids when the plan is written. The declared dependency graph
/// is validated (self-dependencies, unknown keys, cycles) before anything
/// is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanUnitInput {
    /// Plan-local handle used by `depends_on` references.
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}
