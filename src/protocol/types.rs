//! Request and response types for the orchestrator protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Feature, HistoryEntry, PolicyInput, Subtask, WorkUnit};

// ============================================================
// Requests
// ============================================================

/// One protocol call as submitted by an automated caller.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol contract version; a request carrying a different version is
    /// rejected before anything else happens.
    #[serde(default)]
    pub contract_version: Option<String>,
    /// Caller-chosen correlation id, echoed back in the envelope.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Acting identity; resolved from the environment when absent.
    #[serde(default)]
    pub actor: Option<String>,
    /// Policy descriptor; required for mutating commands.
    #[serde(default)]
    pub policy: Option<PolicyInput>,
    #[serde(flatten)]
    pub op: Op,
}

/// The supported commands. Wire shape is `{"command": "...", ...params}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Op {
    /// Snapshot a unit or a whole feature. Read-only.
    QueryState {
        #[serde(default)]
        feature_id: Option<Uuid>,
        #[serde(default)]
        unit_id: Option<Uuid>,
    },
    /// Units whose dependencies are all done. Read-only.
    ListReady { feature_id: Uuid },
    /// Claim a unit, move it to `doing`, and allocate a branch + workspace.
    StartImplementation {
        unit_id: Uuid,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        lock_timeout_secs: Option<u64>,
    },
    /// Pick a rejected unit back up, referencing the prior review.
    StartReview {
        unit_id: Uuid,
        #[serde(default)]
        lock_timeout_secs: Option<u64>,
    },
    /// A generic single transition.
    Transition {
        unit_id: Uuid,
        to: String,
        #[serde(default)]
        note: Option<String>,
        #[serde(default)]
        feedback_ref: Option<Uuid>,
        #[serde(default)]
        force: bool,
        #[serde(default)]
        lock_timeout_secs: Option<u64>,
    },
    /// Record a note in a unit's history without transitioning it.
    AppendHistory {
        unit_id: Uuid,
        note: String,
        #[serde(default)]
        lock_timeout_secs: Option<u64>,
    },
    /// Accept a feature whose units are all done; merges the event streams.
    AcceptFeature {
        feature_id: Uuid,
        #[serde(default)]
        lock_timeout_secs: Option<u64>,
    },
    /// Merge every unit's branch in dependency order, then push.
    MergeFeature {
        feature_id: Uuid,
        #[serde(default)]
        strategy: Option<String>,
        #[serde(default)]
        lock_timeout_secs: Option<u64>,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryState { .. } => "query_state",
            Self::ListReady { .. } => "list_ready",
            Self::StartImplementation { .. } => "start_implementation",
            Self::StartReview { .. } => "start_review",
            Self::Transition { .. } => "transition",
            Self::AppendHistory { .. } => "append_history",
            Self::AcceptFeature { .. } => "accept_feature",
            Self::MergeFeature { .. } => "merge_feature",
        }
    }

    /// Mutating commands require a validated policy descriptor.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::QueryState { .. } | Self::ListReady { .. })
    }
}

// ============================================================
// Responses
// ============================================================

/// A work unit as reported to protocol callers. `lane` is the protocol lane,
/// so a held unit reports `blocked`/`canceled` rather than its internal
/// `planned`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub title: String,
    pub lane: String,
    pub depends_on: Vec<Uuid>,
    pub subtasks: Vec<Subtask>,
    pub assignee: Option<String>,
    pub agent: Option<String>,
    pub notes: Option<String>,
    pub feedback_ref: Option<Uuid>,
    pub branch: Option<String>,
    pub workspace: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl From<&WorkUnit> for UnitSnapshot {
    fn from(unit: &WorkUnit) -> Self {
        Self {
            id: unit.id,
            feature_id: unit.feature_id,
            title: unit.title.clone(),
            lane: unit.protocol_lane().to_string(),
            depends_on: unit.depends_on.clone(),
            subtasks: unit.subtasks.clone(),
            assignee: unit.assignee.clone(),
            agent: unit.agent.clone(),
            notes: unit.notes.clone(),
            feedback_ref: unit.feedback_ref,
            branch: unit.branch.clone(),
            workspace: unit.workspace.clone(),
            history: unit.history.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub feature: Feature,
    pub units: Vec<UnitSnapshot>,
    /// Units currently claimable (planned, unheld, dependencies done).
    pub ready: Vec<Uuid>,
    /// Units unreachable from any dependency-free root. Likely authoring
    /// errors, reported but not fatal.
    pub orphans: Vec<Uuid>,
    pub topological_order: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyListResponse {
    pub feature_id: Uuid,
    pub ready: Vec<UnitSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartImplementationResponse {
    pub unit: UnitSnapshot,
    pub branch: String,
    pub workspace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartReviewResponse {
    pub unit: UnitSnapshot,
    /// Event id of the review being addressed.
    pub prior_review: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionResponse {
    pub unit: UnitSnapshot,
    pub event_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendHistoryResponse {
    pub unit_id: Uuid,
    pub event_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptFeatureResponse {
    pub feature_id: Uuid,
    /// Size of the canonical merged event stream after acceptance.
    pub merged_events: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MergeFeatureResponse {
    pub feature_id: Uuid,
    /// Units merged, in dependency order.
    pub merged_units: Vec<Uuid>,
    pub pushed: bool,
}
