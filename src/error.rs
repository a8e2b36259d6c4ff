//! Engine error taxonomy.
//!
//! Every user-visible failure carries a stable machine-readable code (see
//! [`ErrorCode`]) plus a free-text message. Callers are contracted to branch
//! on the code only, never on message text.

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::models::Lane;
use crate::vcs::VcsError;

/// Stable error codes surfaced in protocol envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UsageError,
    ContractVersionMismatch,
    FeatureNotFound,
    WpNotFound,
    TransitionRejected,
    WpAlreadyClaimed,
    PolicyMetadataRequired,
    PolicyValidationFailed,
    FeatureNotReady,
    PreflightFailed,
    MergeFailed,
    PushFailed,
    UnsupportedStrategy,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsageError => "USAGE_ERROR",
            Self::ContractVersionMismatch => "CONTRACT_VERSION_MISMATCH",
            Self::FeatureNotFound => "FEATURE_NOT_FOUND",
            Self::WpNotFound => "WP_NOT_FOUND",
            Self::TransitionRejected => "TRANSITION_REJECTED",
            Self::WpAlreadyClaimed => "WP_ALREADY_CLAIMED",
            Self::PolicyMetadataRequired => "POLICY_METADATA_REQUIRED",
            Self::PolicyValidationFailed => "POLICY_VALIDATION_FAILED",
            Self::FeatureNotReady => "FEATURE_NOT_READY",
            Self::PreflightFailed => "PREFLIGHT_FAILED",
            Self::MergeFailed => "MERGE_FAILED",
            Self::PushFailed => "PUSH_FAILED",
            Self::UnsupportedStrategy => "UNSUPPORTED_STRATEGY",
        }
    }
}

/// The specific unmet guard behind a `TRANSITION_REJECTED`.
///
/// Always names the concrete blocking condition (which dependency, which
/// subtask), never just "invalid transition".
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "guard", rename_all = "snake_case")]
pub enum RejectionReason {
    /// A declared dependency has not reached `done`.
    DependencyNotDone { dependency: Uuid, lane: Lane },
    /// A subtask is still unchecked.
    SubtaskIncomplete { subtask: String },
    /// `for_review → planned` needs the rejecting review's event id.
    MissingFeedbackRef,
    /// Self-review is disallowed and the reviewer is the assignee.
    SelfReviewDisallowed { actor: String },
    /// The unit is claimed by someone else.
    AlreadyClaimed { holder: String },
    /// The unit sits under a `blocked`/`canceled` hold.
    HoldActive { hold: String },
    /// `start_review` needs a prior rejected review to pick up.
    NoPriorReview,
    /// Administrative resets must be explicit.
    ResetRequiresForce { from: String, to: String },
    /// The from → to pair is not a transition at all (not forceable).
    NoSuchTransition { from: String, to: String },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DependencyNotDone { dependency, lane } => {
                write!(f, "dependency {dependency} is {lane}, not done")
            }
            Self::SubtaskIncomplete { subtask } => {
                write!(f, "subtask '{subtask}' is not complete")
            }
            Self::MissingFeedbackRef => {
                write!(f, "rejection back to planned requires a feedback reference")
            }
            Self::SelfReviewDisallowed { actor } => {
                write!(f, "reviewer '{actor}' is the assignee and self-review is disallowed")
            }
            Self::AlreadyClaimed { holder } => write!(f, "unit is claimed by '{holder}'"),
            Self::HoldActive { hold } => write!(f, "unit is {hold}; leaving a hold requires force"),
            Self::NoPriorReview => {
                write!(f, "unit carries no feedback reference from a rejected review")
            }
            Self::ResetRequiresForce { from, to } => {
                write!(f, "reset {from} → {to} requires force")
            }
            Self::NoSuchTransition { from, to } => {
                write!(f, "no transition from {from} to {to}")
            }
        }
    }
}

/// All failures the engine can report.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("contract version '{requested}' is not supported (expected '{supported}')")]
    ContractVersionMismatch { requested: String, supported: String },

    #[error("feature {0} not found")]
    FeatureNotFound(Uuid),

    #[error("work unit {0} not found")]
    UnitNotFound(Uuid),

    #[error("transition rejected for unit {unit_id}: {reason}")]
    TransitionRejected { unit_id: Uuid, reason: RejectionReason },

    #[error("work unit {unit_id} is already claimed by '{holder}'")]
    AlreadyClaimed { unit_id: Uuid, holder: String },

    #[error("could not acquire lock on '{resource}' within {waited_ms}ms (held by '{holder}')")]
    LockTimeout {
        resource: String,
        holder: String,
        waited_ms: u64,
    },

    #[error("policy metadata required; missing: {}", missing.join(", "))]
    PolicyMetadataRequired { missing: Vec<String> },

    #[error("policy validation failed: {reason}")]
    PolicyValidationFailed { reason: String },

    #[error("feature {feature_id} is not ready: {} unit(s) not done", pending.len())]
    FeatureNotReady {
        feature_id: Uuid,
        /// Units still short of `done`, with their current protocol lane.
        pending: Vec<(Uuid, String)>,
    },

    #[error("dependency graph invalid: {0}")]
    Graph(#[from] crate::graph::GraphError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("unsupported merge strategy '{0}'")]
    UnsupportedStrategy(String),

    #[error("corrupt record at {path}: {detail}")]
    CorruptRecord { path: PathBuf, detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The stable code this failure maps to on the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Usage(_) | Self::CorruptRecord { .. } | Self::Io { .. } | Self::Graph(_) => {
                ErrorCode::UsageError
            }
            Self::ContractVersionMismatch { .. } => ErrorCode::ContractVersionMismatch,
            Self::FeatureNotFound(_) => ErrorCode::FeatureNotFound,
            Self::UnitNotFound(_) => ErrorCode::WpNotFound,
            Self::TransitionRejected { .. } => ErrorCode::TransitionRejected,
            // Lock contention and claim races are the same retryable class.
            Self::AlreadyClaimed { .. } | Self::LockTimeout { .. } => ErrorCode::WpAlreadyClaimed,
            Self::PolicyMetadataRequired { .. } => ErrorCode::PolicyMetadataRequired,
            Self::PolicyValidationFailed { .. } => ErrorCode::PolicyValidationFailed,
            Self::FeatureNotReady { .. } => ErrorCode::FeatureNotReady,
            Self::Vcs(vcs) => match vcs {
                VcsError::Merge { .. } => ErrorCode::MergeFailed,
                VcsError::Push(_) => ErrorCode::PushFailed,
                VcsError::Preflight(_) | VcsError::Branch(_) | VcsError::Workspace(_) => {
                    ErrorCode::PreflightFailed
                }
            },
            Self::UnsupportedStrategy(_) => ErrorCode::UnsupportedStrategy,
        }
    }

    /// Structured detail for the envelope's `data` field on failure, naming
    /// the specific unmet condition where one exists.
    pub fn detail(&self) -> serde_json::Value {
        match self {
            Self::TransitionRejected { unit_id, reason } => serde_json::json!({
                "unit_id": unit_id,
                "reason": reason,
                "message": reason.to_string(),
            }),
            Self::FeatureNotReady { feature_id, pending } => serde_json::json!({
                "feature_id": feature_id,
                "pending": pending
                    .iter()
                    .map(|(id, lane)| serde_json::json!({ "unit_id": id, "lane": lane }))
                    .collect::<Vec<_>>(),
            }),
            Self::PolicyMetadataRequired { missing } => {
                serde_json::json!({ "missing": missing })
            }
            Self::AlreadyClaimed { unit_id, holder } => {
                serde_json::json!({ "unit_id": unit_id, "holder": holder, "retryable": true })
            }
            Self::LockTimeout { resource, holder, waited_ms } => serde_json::json!({
                "resource": resource,
                "holder": holder,
                "waited_ms": waited_ms,
                "retryable": true,
            }),
            Self::Graph(err) => err.detail(),
            _ => serde_json::Value::Null,
        }
    }
}
