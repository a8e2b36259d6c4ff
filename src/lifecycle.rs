//! The work-unit lane state machine.
//!
//! | from       | to         | guard                                   |
//! |------------|------------|-----------------------------------------|
//! | planned    | doing      | all deps done; not claimed by another   |
//! | doing      | for_review | all subtasks complete                   |
//! | for_review | done       | reviewer distinct from assignee*        |
//! | for_review | planned    | feedback reference present              |
//! | any        | planned/doing | administrative reset, force required |
//!
//! *unless `allow_self_review` is set. Every row is forceable; a forced
//! transition still lands in history with its force flag preserved so
//! audits can tell guarded from overridden. `blocked`/`canceled` targets
//! set a hold overlay and park the internal lane at `planned`.
//!
//! A transition is one guard check plus one logical write: the event is
//! staged inside the unit record and committed by its single atomic
//! replace under the caller-held unit lock, so record and event become
//! durable together and no partial transition is ever observable. The
//! stream append that follows is a projection of that commit, replayed
//! from the staged copy if interrupted.

use chrono::Utc;

use crate::error::{EngineError, RejectionReason};
use crate::graph::DependencyGraph;
use crate::models::{
    Event, EventKind, HistoryEntry, Lane, LaneTarget, TransitionRequest, WorkUnit,
};
use crate::store::{RootConfig, WorkRoot};

/// The applied transition: the updated record and the event that recorded it.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub unit: WorkUnit,
    pub event: Event,
}

pub struct LaneMachine<'a> {
    store: &'a WorkRoot,
    config: &'a RootConfig,
}

impl<'a> LaneMachine<'a> {
    pub fn new(store: &'a WorkRoot, config: &'a RootConfig) -> Self {
        Self { store, config }
    }

    /// Apply one transition to a freshly-loaded unit.
    ///
    /// The caller must hold the unit's lock and pass the feature's full unit
    /// set (`peers`) for dependency guards. On a guard violation the error
    /// names the specific unmet condition; nothing is written.
    pub fn apply(
        &self,
        mut unit: WorkUnit,
        peers: &[WorkUnit],
        req: &TransitionRequest,
    ) -> Result<TransitionOutcome, EngineError> {
        let from = unit.protocol_lane().to_string();
        let to = req.to.as_str().to_string();

        if let Some(reason) = self.guard(&unit, peers, req) {
            return Err(EngineError::TransitionRejected {
                unit_id: unit.id,
                reason,
            });
        }

        match req.to {
            LaneTarget::Hold(hold) => {
                unit.lane = Lane::Planned;
                unit.hold = Some(hold);
            }
            LaneTarget::Lane(to_lane) => {
                let reset = !matches!(
                    (unit.lane, unit.hold, to_lane),
                    (Lane::Planned, None, Lane::Doing)
                        | (Lane::Doing, None, Lane::ForReview)
                        | (Lane::ForReview, None, Lane::Done)
                        | (Lane::ForReview, None, Lane::Planned)
                );
                match to_lane {
                    Lane::Doing => {
                        unit.assignee = Some(req.actor.clone());
                    }
                    Lane::Planned if reset => {
                        unit.assignee = None;
                        unit.agent = None;
                    }
                    Lane::Planned => {
                        // Rejection out of review: record what is being
                        // addressed, keep the implementer on the unit.
                        unit.feedback_ref = req.feedback_ref.or(unit.feedback_ref);
                    }
                    Lane::ForReview | Lane::Done => {}
                }
                unit.hold = None;
                unit.lane = to_lane;
            }
        }

        unit.history.push(HistoryEntry {
            at: Utc::now(),
            lane: unit.protocol_lane().to_string(),
            actor: req.actor.clone(),
            note: req.note.clone(),
            forced: req.force,
        });
        unit.updated_at = Utc::now();

        let mut payload = serde_json::json!({
            "from": from,
            "to": to,
            "forced": req.force,
        });
        if let Some(feedback_ref) = req.feedback_ref {
            payload["feedback_ref"] = serde_json::json!(feedback_ref);
        }
        if let Some(note) = &req.note {
            payload["note"] = serde_json::json!(note);
        }
        let event = Event::new(
            unit.feature_id,
            Some(unit.id),
            EventKind::Transition,
            req.actor.clone(),
            payload,
        );

        // The record rename is the single commit point: the event is staged
        // inside the record, so record and event become durable in one
        // atomic replace. The stream append is a projection of that commit;
        // a crash before it leaves the staged copy for the next flush.
        unit.pending_event = Some(event.clone());
        self.store.save_unit(&unit)?;
        let log = self.store.event_log(unit.feature_id);
        log.append(&event)?;
        unit.pending_event = None;
        self.store.save_unit(&unit)?;

        tracing::debug!(
            unit_id = %unit.id,
            %from,
            %to,
            forced = req.force,
            actor = %req.actor,
            "transition applied"
        );
        Ok(TransitionOutcome { unit, event })
    }

    /// Evaluate the guard for a requested transition. `None` means the
    /// transition may proceed (possibly because force overrides a guard).
    fn guard(
        &self,
        unit: &WorkUnit,
        peers: &[WorkUnit],
        req: &TransitionRequest,
    ) -> Option<RejectionReason> {
        // Entering a hold: any non-done unit may be parked; force reopens
        // the question for done ones.
        if let LaneTarget::Hold(_) = req.to {
            if unit.hold.is_some() && !req.force {
                return Some(RejectionReason::HoldActive {
                    hold: unit.protocol_lane().to_string(),
                });
            }
            if unit.lane == Lane::Done && !req.force {
                return Some(RejectionReason::NoSuchTransition {
                    from: unit.protocol_lane().to_string(),
                    to: req.to.as_str().to_string(),
                });
            }
            return None;
        }

        let LaneTarget::Lane(to) = req.to else {
            unreachable!("hold handled above")
        };

        // Leaving a hold is always an administrative reset.
        if unit.hold.is_some() {
            if !matches!(to, Lane::Planned | Lane::Doing) {
                return Some(RejectionReason::NoSuchTransition {
                    from: unit.protocol_lane().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            if !req.force {
                return Some(RejectionReason::HoldActive {
                    hold: unit.protocol_lane().to_string(),
                });
            }
            return None;
        }

        let violation = match (unit.lane, to) {
            (Lane::Planned, Lane::Doing) => self.claim_guard(unit, peers, req),
            (Lane::Doing, Lane::ForReview) => unit
                .subtasks_pending()
                .next()
                .map(|subtask| RejectionReason::SubtaskIncomplete {
                    subtask: subtask.title.clone(),
                }),
            (Lane::ForReview, Lane::Done) => self.review_guard(unit, req),
            (Lane::ForReview, Lane::Planned) => {
                (req.feedback_ref.is_none() && unit.feedback_ref.is_none())
                    .then_some(RejectionReason::MissingFeedbackRef)
            }
            // Administrative reset; always needs force.
            (_, Lane::Planned | Lane::Doing) => {
                return (!req.force).then(|| RejectionReason::ResetRequiresForce {
                    from: unit.lane.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
            }
            // Not a transition at all; force does not invent edges.
            _ => {
                return Some(RejectionReason::NoSuchTransition {
                    from: unit.lane.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
            }
        };

        match violation {
            Some(reason) if !req.force => Some(reason),
            _ => None,
        }
    }

    fn claim_guard(
        &self,
        unit: &WorkUnit,
        peers: &[WorkUnit],
        req: &TransitionRequest,
    ) -> Option<RejectionReason> {
        if let Some(holder) = unit.assignee.as_deref() {
            if holder != req.actor {
                return Some(RejectionReason::AlreadyClaimed {
                    holder: holder.to_string(),
                });
            }
        }
        let graph = DependencyGraph::build(peers);
        graph
            .unmet_dependencies(unit.id)
            .into_iter()
            .next()
            .map(|(dependency, lane)| RejectionReason::DependencyNotDone { dependency, lane })
    }

    fn review_guard(&self, unit: &WorkUnit, req: &TransitionRequest) -> Option<RejectionReason> {
        if self.config.allow_self_review {
            return None;
        }
        match unit.assignee.as_deref() {
            Some(assignee) if assignee == req.actor => {
                Some(RejectionReason::SelfReviewDisallowed {
                    actor: req.actor.clone(),
                })
            }
            _ => None,
        }
    }
}

/// Pre-check used by composite operations to fail fast with a claim error
/// before any lock-held work happens.
pub fn is_claimable(unit: &WorkUnit, actor: &str) -> bool {
    unit.lane == Lane::Planned
        && unit.hold.is_none()
        && unit.assignee.as_deref().map_or(true, |a| a == actor)
}
