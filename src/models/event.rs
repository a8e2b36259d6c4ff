use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single immutable fact in a feature's history.
///
/// Event ids are UUIDv7, so sorting by id is sorting by creation time and
/// two streams written by independent workspaces merge into one deterministic
/// order regardless of wall-clock arrival. Events are never edited or
/// removed; a correction is a new event whose `corrects` field names the
/// corrected one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub feature_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<Uuid>,
    pub kind: EventKind,
    pub actor: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrects: Option<Uuid>,
}

impl Event {
    pub fn new(
        feature_id: Uuid,
        unit_id: Option<Uuid>,
        kind: EventKind,
        actor: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            feature_id,
            unit_id,
            kind,
            actor: actor.into(),
            at: Utc::now(),
            payload,
            corrects: None,
        }
    }

    /// Synthetic first event for a stream that would otherwise be empty at a
    /// package boundary. Carries scope-identifying metadata so every exported
    /// stream is non-empty and self-describing.
    pub fn bootstrap(feature_id: Uuid, workspace: &str) -> Self {
        Self::new(
            feature_id,
            None,
            EventKind::Bootstrap,
            "worksmith",
            serde_json::json!({ "workspace": workspace }),
        )
    }
}

/// What kind of fact an event records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Synthetic stream-opening event (empty stream at a package boundary).
    Bootstrap,
    /// A lane transition, forced or guarded.
    Transition,
    /// A non-transitioning history note.
    Note,
    /// A unit was claimed by an agent (start of implementation).
    Claim,
    /// Every unit in the feature reached `done` and the feature was accepted.
    FeatureAccepted,
    /// A unit's branch was merged during `merge_feature`.
    UnitMerged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Transition => "transition",
            Self::Note => "note",
            Self::Claim => "claim",
            Self::FeatureAccepted => "feature_accepted",
            Self::UnitMerged => "unit_merged",
        }
    }
}
