//! The external protocol surface.
//!
//! Every call returns a fixed-shape [`Envelope`]. Read-only commands need no
//! policy; mutating commands require a complete, validated
//! [`PolicyDescriptor`](crate::models::PolicyDescriptor). Each mutating call
//! acquires the finest lock sufficient for its effect before reading current
//! state; graph-wide operations (accept, merge) hold the feature lock plus
//! every unit lock for their duration, acquired coarse to fine.

mod types;

pub use types::*;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, RejectionReason};
use crate::graph::DependencyGraph;
use crate::lifecycle::{is_claimable, LaneMachine};
use crate::lock::{LockGuard, LockManager, LockScope};
use crate::models::{Event, EventKind, HistoryEntry, Lane, LaneTarget, TransitionRequest};
use crate::store::{RootConfig, WorkRoot};
use crate::vcs::Vcs;

/// Protocol contract version carried in every envelope.
pub const CONTRACT_VERSION: &str = "1";

/// Environment variable supplying a default acting identity.
pub const ACTOR_ENV_VAR: &str = "WORKSMITH_ACTOR";

/// The fixed-shape protocol result.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub contract_version: &'static str,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub success: bool,
    /// Stable machine-readable code; empty string on success. Callers must
    /// branch on this, never on message text.
    pub error_code: String,
    pub data: Value,
}

impl Envelope {
    fn ok(command: &str, correlation_id: Uuid, data: Value) -> Self {
        Self {
            contract_version: CONTRACT_VERSION,
            command: command.to_string(),
            timestamp: Utc::now(),
            correlation_id,
            success: true,
            error_code: String::new(),
            data,
        }
    }

    fn fail(command: &str, correlation_id: Uuid, err: &EngineError) -> Self {
        let mut data = err.detail();
        let message = err.to_string();
        match &mut data {
            Value::Object(map) => {
                map.entry("message").or_insert_with(|| message.into());
            }
            Value::Null => data = serde_json::json!({ "message": message }),
            _ => {}
        }
        Self {
            contract_version: CONTRACT_VERSION,
            command: command.to_string(),
            timestamp: Utc::now(),
            correlation_id,
            success: false,
            error_code: err.code().as_str().to_string(),
            data,
        }
    }
}

/// The orchestration engine behind the protocol surface.
pub struct Orchestrator {
    store: WorkRoot,
    locks: LockManager,
    config: RootConfig,
    vcs: Box<dyn Vcs>,
}

impl Orchestrator {
    pub fn new(store: WorkRoot, vcs: Box<dyn Vcs>) -> Result<Self, EngineError> {
        let config = store.load_config()?;
        let locks = LockManager::new(store.path());
        Ok(Self {
            store,
            locks,
            config,
            vcs,
        })
    }

    pub fn store(&self) -> &WorkRoot {
        &self.store
    }

    /// Handle one protocol call, always producing an envelope.
    pub fn dispatch(&self, request: Request) -> Envelope {
        let command = request.op.name();
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);
        match self.execute(request) {
            Ok(data) => Envelope::ok(command, correlation_id, data),
            Err(err) => {
                tracing::debug!(command, code = err.code().as_str(), %err, "request failed");
                Envelope::fail(command, correlation_id, &err)
            }
        }
    }

    fn execute(&self, request: Request) -> Result<Value, EngineError> {
        if let Some(version) = request.contract_version.as_deref() {
            if version != CONTRACT_VERSION {
                return Err(EngineError::ContractVersionMismatch {
                    requested: version.to_string(),
                    supported: CONTRACT_VERSION.to_string(),
                });
            }
        }

        let actor = resolve_actor(request.actor);

        // Policy is validated before any side effect; a rejected descriptor
        // never reaches a lock, let alone a write.
        if request.op.is_mutating() {
            request
                .policy
                .ok_or_else(|| EngineError::PolicyMetadataRequired {
                    missing: vec!["policy".to_string()],
                })?
                .validate()?;
        }

        match request.op {
            Op::QueryState {
                feature_id,
                unit_id,
            } => self.query_state(feature_id, unit_id),
            Op::ListReady { feature_id } => self.list_ready(feature_id),
            Op::StartImplementation {
                unit_id,
                agent,
                lock_timeout_secs,
            } => self.start_implementation(unit_id, agent, &actor, self.timeout(lock_timeout_secs)),
            Op::StartReview {
                unit_id,
                lock_timeout_secs,
            } => self.start_review(unit_id, &actor, self.timeout(lock_timeout_secs)),
            Op::Transition {
                unit_id,
                to,
                note,
                feedback_ref,
                force,
                lock_timeout_secs,
            } => {
                let to = LaneTarget::from_str(&to)
                    .ok_or_else(|| EngineError::Usage(format!("unknown lane '{to}'")))?;
                let request = TransitionRequest {
                    unit_id,
                    to,
                    actor,
                    note,
                    feedback_ref,
                    force,
                };
                self.transition(request, self.timeout(lock_timeout_secs))
            }
            Op::AppendHistory {
                unit_id,
                note,
                lock_timeout_secs,
            } => self.append_history(unit_id, note, &actor, self.timeout(lock_timeout_secs)),
            Op::AcceptFeature {
                feature_id,
                lock_timeout_secs,
            } => self.accept_feature(feature_id, &actor, self.timeout(lock_timeout_secs)),
            Op::MergeFeature {
                feature_id,
                strategy,
                lock_timeout_secs,
            } => self.merge_feature(feature_id, strategy, &actor, self.timeout(lock_timeout_secs)),
        }
    }

    fn timeout(&self, requested: Option<u64>) -> Duration {
        Duration::from_secs(requested.unwrap_or(self.config.lock_timeout_secs))
    }

    // ============================================================
    // Read-only operations
    // ============================================================

    fn query_state(
        &self,
        feature_id: Option<Uuid>,
        unit_id: Option<Uuid>,
    ) -> Result<Value, EngineError> {
        if let Some(unit_id) = unit_id {
            let unit = self.store.find_unit(unit_id)?;
            return to_value(&UnitSnapshot::from(&unit));
        }
        let Some(feature_id) = feature_id else {
            return Err(EngineError::Usage(
                "query_state needs a feature_id or a unit_id".into(),
            ));
        };
        let feature = self.store.load_feature(feature_id)?;
        let units = self.store.list_units(feature_id)?;
        let graph = DependencyGraph::build(&units);
        let topological_order = graph.topological_order()?;
        let snapshot = FeatureSnapshot {
            feature,
            units: units.iter().map(UnitSnapshot::from).collect(),
            ready: graph.ready(),
            orphans: graph.orphans(),
            topological_order,
        };
        to_value(&snapshot)
    }

    fn list_ready(&self, feature_id: Uuid) -> Result<Value, EngineError> {
        let units = self.store.list_units(feature_id)?;
        let graph = DependencyGraph::build(&units);
        graph.validate()?;
        let ready = graph.ready();
        let response = ReadyListResponse {
            feature_id,
            ready: units
                .iter()
                .filter(|u| ready.contains(&u.id))
                .map(UnitSnapshot::from)
                .collect(),
        };
        to_value(&response)
    }

    // ============================================================
    // Unit-scoped mutations
    // ============================================================

    fn transition(
        &self,
        request: TransitionRequest,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        // Locate first (unlocked) to learn the feature, then re-read fresh
        // state under the unit lock before touching anything.
        let located = self.store.find_unit(request.unit_id)?;
        let _guard = self
            .locks
            .acquire(LockScope::Unit, located.id, &request.actor, timeout)?;
        let unit = self.store.load_unit(located.feature_id, located.id)?;
        let peers = self.store.list_units(unit.feature_id)?;

        let machine = LaneMachine::new(&self.store, &self.config);
        let outcome = machine.apply(unit, &peers, &request)?;
        to_value(&TransitionResponse {
            unit: UnitSnapshot::from(&outcome.unit),
            event_id: outcome.event.id,
        })
    }

    fn start_implementation(
        &self,
        unit_id: Uuid,
        agent: Option<String>,
        actor: &str,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let located = self.store.find_unit(unit_id)?;
        let _guard = self
            .locks
            .acquire(LockScope::Unit, located.id, actor, timeout)?;
        let mut unit = self.store.load_unit(located.feature_id, located.id)?;
        let peers = self.store.list_units(unit.feature_id)?;

        if let Some(holder) = unit.assignee.as_deref().filter(|h| *h != actor) {
            return Err(EngineError::AlreadyClaimed {
                unit_id: unit.id,
                holder: holder.to_string(),
            });
        }
        // A unit already in flight reports as claimed, even to its own
        // assignee retrying the call. Retries stay distinguishable from
        // guard violations.
        if unit.lane != Lane::Planned {
            return Err(EngineError::AlreadyClaimed {
                unit_id: unit.id,
                holder: unit.assignee.clone().unwrap_or_else(|| actor.to_string()),
            });
        }
        if !is_claimable(&unit, actor) {
            return Err(EngineError::TransitionRejected {
                unit_id: unit.id,
                reason: RejectionReason::HoldActive {
                    hold: unit.protocol_lane().to_string(),
                },
            });
        }

        // Claim and dependency guards are settled before the VCS
        // collaborator is invoked, so a rejected claim allocates nothing.
        let graph = DependencyGraph::build(&peers);
        if let Some((dependency, lane)) = graph.unmet_dependencies(unit.id).into_iter().next() {
            return Err(EngineError::TransitionRejected {
                unit_id: unit.id,
                reason: RejectionReason::DependencyNotDone { dependency, lane },
            });
        }

        let branch = format!("wp/{}", unit.id);
        self.vcs.create_branch(&branch)?;
        let dest = self.store.path().join("worktrees").join(unit.id.to_string());
        let workspace = self.vcs.create_workspace(&branch, &dest)?;

        unit.branch = Some(branch.clone());
        unit.workspace = Some(workspace.display().to_string());
        unit.agent = agent.clone();

        let machine = LaneMachine::new(&self.store, &self.config);
        let outcome = machine.apply(
            unit,
            &peers,
            &TransitionRequest {
                unit_id,
                to: LaneTarget::Lane(Lane::Doing),
                actor: actor.to_string(),
                note: None,
                feedback_ref: None,
                force: false,
            },
        )?;

        let claim = Event::new(
            outcome.unit.feature_id,
            Some(outcome.unit.id),
            EventKind::Claim,
            actor,
            serde_json::json!({
                "branch": branch,
                "workspace": workspace.display().to_string(),
                "agent": agent,
            }),
        );
        self.store.event_log(outcome.unit.feature_id).append(&claim)?;

        to_value(&StartImplementationResponse {
            unit: UnitSnapshot::from(&outcome.unit),
            branch,
            workspace: workspace.display().to_string(),
        })
    }

    fn start_review(
        &self,
        unit_id: Uuid,
        actor: &str,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let located = self.store.find_unit(unit_id)?;
        let _guard = self
            .locks
            .acquire(LockScope::Unit, located.id, actor, timeout)?;
        let unit = self.store.load_unit(located.feature_id, located.id)?;
        let peers = self.store.list_units(unit.feature_id)?;

        // Only a unit previously rejected out of review carries a feedback
        // reference while sitting in planned; that is what start_review
        // picks back up.
        let Some(prior_review) = unit.feedback_ref.filter(|_| unit.lane == Lane::Planned) else {
            return Err(EngineError::TransitionRejected {
                unit_id: unit.id,
                reason: RejectionReason::NoPriorReview,
            });
        };

        let machine = LaneMachine::new(&self.store, &self.config);
        let outcome = machine.apply(
            unit,
            &peers,
            &TransitionRequest {
                unit_id,
                to: LaneTarget::Lane(Lane::Doing),
                actor: actor.to_string(),
                note: None,
                feedback_ref: Some(prior_review),
                force: false,
            },
        )?;

        to_value(&StartReviewResponse {
            unit: UnitSnapshot::from(&outcome.unit),
            prior_review,
        })
    }

    fn append_history(
        &self,
        unit_id: Uuid,
        note: String,
        actor: &str,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        if note.trim().is_empty() {
            return Err(EngineError::Usage("note must not be empty".into()));
        }
        let located = self.store.find_unit(unit_id)?;
        let _guard = self
            .locks
            .acquire(LockScope::Unit, located.id, actor, timeout)?;
        let mut unit = self.store.load_unit(located.feature_id, located.id)?;

        let event = Event::new(
            unit.feature_id,
            Some(unit.id),
            EventKind::Note,
            actor,
            serde_json::json!({ "note": note }),
        );
        unit.history.push(HistoryEntry {
            at: Utc::now(),
            lane: unit.protocol_lane().to_string(),
            actor: actor.to_string(),
            note: Some(note),
            forced: false,
        });
        unit.updated_at = Utc::now();

        self.store.event_log(unit.feature_id).append(&event)?;
        self.store.save_unit(&unit)?;

        to_value(&AppendHistoryResponse {
            unit_id: unit.id,
            event_id: event.id,
        })
    }

    // ============================================================
    // Graph-wide mutations
    // ============================================================

    /// Feature lock first, then every unit lock (coarse to fine), so this
    /// never deadlocks against a unit mutator, it just waits for it.
    fn lock_feature_wide(
        &self,
        feature_id: Uuid,
        unit_ids: &[Uuid],
        holder: &str,
        timeout: Duration,
    ) -> Result<Vec<LockGuard>, EngineError> {
        let mut guards = Vec::with_capacity(unit_ids.len() + 1);
        guards.push(
            self.locks
                .acquire(LockScope::Feature, feature_id, holder, timeout)?,
        );
        for unit_id in unit_ids {
            guards.push(
                self.locks
                    .acquire(LockScope::Unit, *unit_id, holder, timeout)?,
            );
        }
        Ok(guards)
    }

    fn accept_feature(
        &self,
        feature_id: Uuid,
        actor: &str,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        self.store.load_feature(feature_id)?;
        let unit_ids: Vec<Uuid> = self
            .store
            .list_units(feature_id)?
            .iter()
            .map(|u| u.id)
            .collect();
        let _guards = self.lock_feature_wide(feature_id, &unit_ids, actor, timeout)?;

        // Re-read under the locks; acceptance is judged on fresh state.
        let units = self.store.list_units(feature_id)?;
        let pending: Vec<(Uuid, String)> = units
            .iter()
            .filter(|u| u.lane != Lane::Done || u.hold.is_some())
            .map(|u| (u.id, u.protocol_lane().to_string()))
            .collect();
        if !pending.is_empty() {
            return Err(EngineError::FeatureNotReady {
                feature_id,
                pending,
            });
        }

        // Heal interrupted stream appends before merging: an event staged
        // on a record is part of the committed history.
        for mut unit in units {
            self.store.flush_pending_event(&mut unit)?;
        }

        let log = self.store.event_log(feature_id);
        log.append(&Event::new(
            feature_id,
            None,
            EventKind::FeatureAccepted,
            actor,
            serde_json::json!({ "units": unit_ids }),
        ))?;
        log.ensure_bootstrapped(feature_id)?;
        let merged = log.merge()?;

        tracing::info!(%feature_id, events = merged.len(), "feature accepted");
        to_value(&AcceptFeatureResponse {
            feature_id,
            merged_events: merged.len(),
        })
    }

    fn merge_feature(
        &self,
        feature_id: Uuid,
        strategy: Option<String>,
        actor: &str,
        timeout: Duration,
    ) -> Result<Value, EngineError> {
        let strategy = strategy.unwrap_or_else(|| "merge".to_string());
        if strategy != "merge" {
            return Err(EngineError::UnsupportedStrategy(strategy));
        }

        self.store.load_feature(feature_id)?;
        let unit_ids: Vec<Uuid> = self
            .store
            .list_units(feature_id)?
            .iter()
            .map(|u| u.id)
            .collect();
        let _guards = self.lock_feature_wide(feature_id, &unit_ids, actor, timeout)?;

        let units = self.store.list_units(feature_id)?;
        let pending: Vec<(Uuid, String)> = units
            .iter()
            .filter(|u| u.lane != Lane::Done || u.hold.is_some())
            .map(|u| (u.id, u.protocol_lane().to_string()))
            .collect();
        if !pending.is_empty() {
            return Err(EngineError::FeatureNotReady {
                feature_id,
                pending,
            });
        }

        self.vcs.preflight()?;

        let graph = DependencyGraph::build(&units);
        let order = graph.topological_order()?;
        let log = self.store.event_log(feature_id);

        let mut merged_units = Vec::new();
        for unit_id in order {
            let Some(unit) = units.iter().find(|u| u.id == unit_id) else {
                continue;
            };
            let Some(branch) = unit.branch.as_deref() else {
                // Done without a branch means the work landed elsewhere
                // (forced done, or no VCS allocation); nothing to merge.
                continue;
            };
            self.vcs.merge(branch)?;
            log.append(&Event::new(
                feature_id,
                Some(unit_id),
                EventKind::UnitMerged,
                actor,
                serde_json::json!({ "branch": branch, "strategy": strategy }),
            ))?;
            merged_units.push(unit_id);
            tracing::debug!(%feature_id, %unit_id, branch, "unit merged");
        }

        self.vcs.push()?;

        to_value(&MergeFeatureResponse {
            feature_id,
            merged_units,
            pushed: true,
        })
    }
}

/// Map a caller to an acting identity: explicit value, then the
/// `WORKSMITH_ACTOR` environment variable, then the OS user.
pub fn resolve_actor(explicit: Option<String>) -> String {
    explicit
        .filter(|a| !a.trim().is_empty())
        .or_else(|| std::env::var(ACTOR_ENV_VAR).ok().filter(|a| !a.is_empty()))
        .or_else(|| std::env::var("USER").ok().filter(|a| !a.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Usage(format!("serialization: {e}")))
}
