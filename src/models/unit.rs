use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::Event;

/// An atomic, independently schedulable piece of work.
///
/// A work unit is owned by exactly one [`Feature`](super::Feature) and is
/// mutated only through the lane state machine. Units are never deleted;
/// terminal outcomes are expressed as the `done` lane or a [`Hold`] overlay.
///
/// The persisted record (one JSON file per unit) is the single source of
/// truth for "who is working on what": there is no in-memory claim cache,
/// every process re-reads fresh state under its lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: Uuid,
    pub feature_id: Uuid,
    pub title: String,
    pub lane: Lane,
    /// Protocol-level terminal overlay. While set, the internal lane stays
    /// `planned` so dependency math never sees a fifth lane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<Hold>,
    /// Ids of units that must be `done` before this unit may enter `doing`.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// Who claimed this unit (set by the `planned → doing` transition).
    pub assignee: Option<String>,
    /// Agent identity of the claiming automation, if any.
    pub agent: Option<String>,
    /// Free-text notes carried with the unit.
    pub notes: Option<String>,
    /// Event id of the review that rejected this unit back to `planned`.
    pub feedback_ref: Option<Uuid>,
    /// Branch allocated by the VCS collaborator when work started.
    pub branch: Option<String>,
    /// Isolated workspace path allocated for the claiming agent.
    pub workspace: Option<String>,
    /// Ordered transition history, including forced transitions.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Event committed with the record but not yet projected into the
    /// workspace stream. The record rename makes record and event durable
    /// together; the stream append clears this field, and a crash in
    /// between is healed by [`flush_pending_event`] from the staged copy.
    ///
    /// [`flush_pending_event`]: crate::store::WorkRoot::flush_pending_event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_event: Option<Event>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    /// The lane as seen by protocol callers: a hold overlay shadows the
    /// internal lane.
    pub fn protocol_lane(&self) -> &'static str {
        match self.hold {
            Some(Hold::Blocked) => "blocked",
            Some(Hold::Canceled) => "canceled",
            None => self.lane.as_str(),
        }
    }

    pub fn subtasks_pending(&self) -> impl Iterator<Item = &Subtask> {
        self.subtasks.iter().filter(|s| !s.done)
    }
}

/// The lifecycle lane of a work unit.
///
/// - `Planned`: eligible for claiming once all dependencies are `done`
/// - `Doing`: claimed, work in progress
/// - `ForReview`: implementation finished, awaiting a reviewer
/// - `Done`: terminal; the only entry is `for_review → done`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Planned,
    Doing,
    ForReview,
    Done,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Doing => "doing",
            Self::ForReview => "for_review",
            Self::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "doing" => Some(Self::Doing),
            "for_review" => Some(Self::ForReview),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level terminal overlays. Non-reentrant: leaving a hold requires
/// a forced administrative reset, which clears it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Hold {
    Blocked,
    Canceled,
}

impl Hold {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Canceled => "canceled",
        }
    }
}

/// The target of a transition request: a real lane or a hold overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneTarget {
    Lane(Lane),
    Hold(Hold),
}

impl LaneTarget {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(Self::Hold(Hold::Blocked)),
            "canceled" => Some(Self::Hold(Hold::Canceled)),
            other => Lane::from_str(other).map(Self::Lane),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lane(lane) => lane.as_str(),
            Self::Hold(hold) => hold.as_str(),
        }
    }
}

/// A checklist item within a work unit. All subtasks must be marked done
/// before the unit may leave `doing` without force.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub title: String,
    #[serde(default)]
    pub done: bool,
}

/// One recorded transition (or note) on a work unit.
///
/// `forced` is preserved so later audits can distinguish guarded from
/// overridden transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// The lane (or hold) the unit was in after this entry.
    pub lane: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub forced: bool,
}

/// A caller-supplied request to move a unit to a target lane.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub unit_id: Uuid,
    pub to: LaneTarget,
    pub actor: String,
    pub note: Option<String>,
    /// Event id of the review being addressed (required for
    /// `for_review → planned` unless forced).
    pub feedback_ref: Option<Uuid>,
    pub force: bool,
}
