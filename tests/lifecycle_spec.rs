use speculate2::speculate;
use tempfile::TempDir;
use uuid::Uuid;
use worksmith::error::{EngineError, RejectionReason};
use worksmith::eventlog::EventLog;
use worksmith::lifecycle::LaneMachine;
use worksmith::models::{
    EventKind, Hold, Lane, LaneTarget, PlanFeatureInput, PlanUnitInput, TransitionRequest,
    WorkUnit,
};
use worksmith::store::{RootConfig, WorkRoot};

fn plan(store: &WorkRoot) -> (Uuid, WorkUnit, WorkUnit) {
    let (feature, mut units) = store
        .create_feature(PlanFeatureInput {
            title: "Billing".to_string(),
            units: vec![
                PlanUnitInput {
                    key: "schema".to_string(),
                    title: "Schema migration".to_string(),
                    depends_on: vec![],
                    subtasks: vec!["write migration".to_string()],
                    notes: None,
                },
                PlanUnitInput {
                    key: "api".to_string(),
                    title: "Billing API".to_string(),
                    depends_on: vec!["schema".to_string()],
                    subtasks: vec![],
                    notes: None,
                },
            ],
        })
        .expect("plan feature");
    let api = units.pop().expect("api unit");
    let schema = units.pop().expect("schema unit");
    (feature.id, schema, api)
}

fn request(unit_id: Uuid, to: &str, actor: &str) -> TransitionRequest {
    TransitionRequest {
        unit_id,
        to: LaneTarget::from_str(to).expect("known lane"),
        actor: actor.to_string(),
        note: None,
        feedback_ref: None,
        force: false,
    }
}

fn forced(unit_id: Uuid, to: &str, actor: &str) -> TransitionRequest {
    TransitionRequest {
        force: true,
        ..request(unit_id, to, actor)
    }
}

/// Drive a freshly planned unit to `done` through the guarded path.
fn finish(store: &WorkRoot, machine: &LaneMachine, mut unit: WorkUnit) -> WorkUnit {
    let id = unit.id;
    let peers = store.list_units(unit.feature_id).expect("peers");
    unit = machine
        .apply(unit, &peers, &request(id, "doing", "impl-a"))
        .expect("claim")
        .unit;
    for subtask in &mut unit.subtasks {
        subtask.done = true;
    }
    store.save_unit(&unit).expect("save");
    let peers = store.list_units(unit.feature_id).expect("peers");
    unit = machine
        .apply(unit, &peers, &request(id, "for_review", "impl-a"))
        .expect("submit")
        .unit;
    let peers = store.list_units(unit.feature_id).expect("peers");
    machine
        .apply(unit, &peers, &request(id, "done", "reviewer-b"))
        .expect("approve")
        .unit
}

speculate! {
    before {
        let dir = TempDir::new().expect("temp dir");
        let store = WorkRoot::at(dir.path().to_path_buf());
        let config = RootConfig::default();
        let machine = LaneMachine::new(&store, &config);
        let (feature_id, schema, api) = plan(&store);
        let peers = store.list_units(feature_id).expect("peers");
    }

    describe "claiming" {
        it "moves planned to doing and records the assignee" {
            let outcome = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim");

            assert_eq!(outcome.unit.lane, Lane::Doing);
            assert_eq!(outcome.unit.assignee.as_deref(), Some("impl-a"));
            assert_eq!(outcome.event.kind, EventKind::Transition);
        }

        it "rejects a claim naming the specific unmet dependency" {
            match machine.apply(api.clone(), &peers, &request(api.id, "doing", "impl-a")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::DependencyNotDone { dependency, lane },
                    ..
                }) => {
                    assert_eq!(dependency, schema.id);
                    assert_eq!(lane, Lane::Planned);
                }
                other => panic!("expected dependency rejection, got {other:?}"),
            }
        }

        it "rejects a claim on a unit held by another agent" {
            let claimed = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim")
                .unit;
            let reset = machine
                .apply(claimed, &peers, &forced(schema.id, "planned", "lead"))
                .expect("reset");
            // A forced reset clears the claim; re-claim, then contend.
            assert!(reset.unit.assignee.is_none());

            let claimed = machine
                .apply(reset.unit, &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim")
                .unit;
            match machine.apply(claimed, &peers, &request(schema.id, "doing", "impl-b")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::AlreadyClaimed { holder },
                    ..
                }) => assert_eq!(holder, "impl-a"),
                other => panic!("expected claim rejection, got {other:?}"),
            }
        }

        it "unblocks the dependent once the dependency is done" {
            finish(&store, &machine, schema.clone());

            let peers = store.list_units(feature_id).expect("peers");
            let api = store.load_unit(feature_id, api.id).expect("reload");
            let outcome = machine
                .apply(api.clone(), &peers, &request(api.id, "doing", "impl-b"))
                .expect("claim dependent");
            assert_eq!(outcome.unit.lane, Lane::Doing);
        }
    }

    describe "review submission" {
        it "rejects for_review while a subtask is unchecked" {
            let doing = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim")
                .unit;

            match machine.apply(doing, &peers, &request(schema.id, "for_review", "impl-a")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::SubtaskIncomplete { subtask },
                    ..
                }) => assert_eq!(subtask, "write migration"),
                other => panic!("expected subtask rejection, got {other:?}"),
            }
        }

        it "force overrides the subtask guard and is preserved in history" {
            let doing = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim")
                .unit;

            let outcome = machine
                .apply(doing, &peers, &forced(schema.id, "for_review", "impl-a"))
                .expect("forced submit");
            assert_eq!(outcome.unit.lane, Lane::ForReview);

            let last = outcome.unit.history.last().expect("history entry");
            assert!(last.forced);
            assert_eq!(outcome.event.payload["forced"], serde_json::json!(true));
        }
    }

    describe "review outcome" {
        before {
            let mut in_review = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim")
                .unit;
            for subtask in &mut in_review.subtasks {
                subtask.done = true;
            }
            store.save_unit(&in_review).expect("save");
            let in_review = machine
                .apply(in_review, &peers, &request(schema.id, "for_review", "impl-a"))
                .expect("submit")
                .unit;
        }

        it "rejects approval by the implementer" {
            match machine.apply(in_review.clone(), &peers, &request(schema.id, "done", "impl-a")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::SelfReviewDisallowed { actor },
                    ..
                }) => assert_eq!(actor, "impl-a"),
                other => panic!("expected self-review rejection, got {other:?}"),
            }
        }

        it "accepts approval by a distinct reviewer" {
            let outcome = machine
                .apply(in_review.clone(), &peers, &request(schema.id, "done", "reviewer-b"))
                .expect("approve");
            assert_eq!(outcome.unit.lane, Lane::Done);
        }

        it "permits self review when the project allows it" {
            let permissive = RootConfig {
                allow_self_review: true,
                ..RootConfig::default()
            };
            let machine = LaneMachine::new(&store, &permissive);
            let outcome = machine
                .apply(in_review.clone(), &peers, &request(schema.id, "done", "impl-a"))
                .expect("self approve");
            assert_eq!(outcome.unit.lane, Lane::Done);
        }

        it "rejects sending back to planned without a feedback reference" {
            match machine.apply(in_review.clone(), &peers, &request(schema.id, "planned", "reviewer-b")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::MissingFeedbackRef,
                    ..
                }) => {}
                other => panic!("expected feedback-ref rejection, got {other:?}"),
            }
        }

        it "records the feedback reference on rejection and keeps the implementer" {
            let review_event = Uuid::now_v7();
            let mut rejection = request(schema.id, "planned", "reviewer-b");
            rejection.feedback_ref = Some(review_event);

            let outcome = machine
                .apply(in_review.clone(), &peers, &rejection)
                .expect("send back");
            assert_eq!(outcome.unit.lane, Lane::Planned);
            assert_eq!(outcome.unit.feedback_ref, Some(review_event));
            assert_eq!(outcome.unit.assignee.as_deref(), Some("impl-a"));
        }
    }

    describe "administrative resets" {
        it "rejects done to planned without force" {
            let done = finish(&store, &machine, schema.clone());

            match machine.apply(done, &peers, &request(schema.id, "planned", "lead")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::ResetRequiresForce { .. },
                    ..
                }) => {}
                other => panic!("expected reset rejection, got {other:?}"),
            }
        }

        it "forced reset to planned clears the claim" {
            let done = finish(&store, &machine, schema.clone());

            let outcome = machine
                .apply(done, &peers, &forced(schema.id, "planned", "lead"))
                .expect("forced reset");
            assert_eq!(outcome.unit.lane, Lane::Planned);
            assert!(outcome.unit.assignee.is_none());
            assert!(outcome.unit.agent.is_none());
        }

        it "never invents a planned to done edge, even forced" {
            match machine.apply(schema.clone(), &peers, &forced(schema.id, "done", "lead")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::NoSuchTransition { from, to },
                    ..
                }) => {
                    assert_eq!(from, "planned");
                    assert_eq!(to, "done");
                }
                other => panic!("expected no-such-transition, got {other:?}"),
            }
        }
    }

    describe "holds" {
        it "parks the unit and shadows the lane at the protocol level" {
            let doing = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim")
                .unit;
            let outcome = machine
                .apply(doing, &peers, &request(schema.id, "blocked", "lead"))
                .expect("park");

            assert_eq!(outcome.unit.lane, Lane::Planned);
            assert_eq!(outcome.unit.hold, Some(Hold::Blocked));
            assert_eq!(outcome.unit.protocol_lane(), "blocked");
        }

        it "requires force to leave a hold" {
            let parked = machine
                .apply(schema.clone(), &peers, &request(schema.id, "canceled", "lead"))
                .expect("park")
                .unit;

            match machine.apply(parked.clone(), &peers, &request(schema.id, "planned", "lead")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::HoldActive { hold },
                    ..
                }) => assert_eq!(hold, "canceled"),
                other => panic!("expected hold rejection, got {other:?}"),
            }

            let outcome = machine
                .apply(parked, &peers, &forced(schema.id, "planned", "lead"))
                .expect("forced resume");
            assert!(outcome.unit.hold.is_none());
            assert_eq!(outcome.unit.protocol_lane(), "planned");
        }

        it "excludes a held unit from claiming" {
            let parked = machine
                .apply(schema.clone(), &peers, &request(schema.id, "blocked", "lead"))
                .expect("park")
                .unit;

            match machine.apply(parked, &peers, &request(schema.id, "doing", "impl-a")) {
                Err(EngineError::TransitionRejected {
                    reason: RejectionReason::HoldActive { .. },
                    ..
                }) => {}
                other => panic!("expected hold rejection, got {other:?}"),
            }
        }
    }

    describe "event stream" {
        it "appends one transition event per applied transition" {
            machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim");

            let stream = dir
                .path()
                .join("features")
                .join(feature_id.to_string())
                .join("events")
                .join(format!("{}.jsonl", store.workspace()));
            let events = EventLog::read_stream(&stream).expect("read");
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::Transition);
            assert_eq!(events[0].payload["from"], serde_json::json!("planned"));
            assert_eq!(events[0].payload["to"], serde_json::json!("doing"));
            assert_eq!(events[0].unit_id, Some(schema.id));
        }

        it "commits the record with no event left staged" {
            let outcome = machine
                .apply(schema.clone(), &peers, &request(schema.id, "doing", "impl-a"))
                .expect("claim");
            assert!(outcome.unit.pending_event.is_none());

            let persisted = store.load_unit(feature_id, schema.id).expect("reload");
            assert!(persisted.pending_event.is_none());
            assert_eq!(persisted.lane, Lane::Doing);
        }
    }
}
