use chrono::Utc;
use speculate2::speculate;
use uuid::Uuid;
use worksmith::graph::{DependencyGraph, GraphError};
use worksmith::models::{Hold, Lane, WorkUnit};

fn unit(feature_id: Uuid, lane: Lane, depends_on: Vec<Uuid>) -> WorkUnit {
    let now = Utc::now();
    WorkUnit {
        id: Uuid::new_v4(),
        feature_id,
        title: "unit".to_string(),
        lane,
        hold: None,
        depends_on,
        subtasks: Vec::new(),
        assignee: None,
        agent: None,
        notes: None,
        feedback_ref: None,
        branch: None,
        workspace: None,
        history: Vec::new(),
        pending_event: None,
        created_at: now,
        updated_at: now,
    }
}

speculate! {
    before {
        let feature_id = Uuid::new_v4();
    }

    describe "validate" {
        it "accepts an empty graph" {
            let graph = DependencyGraph::build(&[]);
            assert!(graph.validate().expect("valid").is_empty());
        }

        it "rejects a self-dependency" {
            let mut a = unit(feature_id, Lane::Planned, Vec::new());
            a.depends_on = vec![a.id];

            let graph = DependencyGraph::build(&[a.clone()]);
            match graph.validate() {
                Err(GraphError::SelfDependency { unit }) => assert_eq!(unit, a.id),
                other => panic!("expected self-dependency error, got {other:?}"),
            }
        }

        it "rejects a dependency on a unit outside the feature" {
            let a = unit(feature_id, Lane::Planned, vec![Uuid::new_v4()]);

            let graph = DependencyGraph::build(&[a]);
            assert!(matches!(
                graph.validate(),
                Err(GraphError::UnknownDependency { .. })
            ));
        }

        it "reports the exact edges of a cycle" {
            let mut a = unit(feature_id, Lane::Planned, Vec::new());
            let mut b = unit(feature_id, Lane::Planned, Vec::new());
            let c = unit(feature_id, Lane::Planned, Vec::new());
            a.depends_on = vec![b.id];
            b.depends_on = vec![a.id, c.id];

            let graph = DependencyGraph::build(&[a.clone(), b.clone(), c]);
            match graph.validate() {
                Err(GraphError::Cycle { edges }) => {
                    assert_eq!(edges.len(), 2);
                    assert!(edges.contains(&(a.id, b.id)));
                    assert!(edges.contains(&(b.id, a.id)));
                }
                other => panic!("expected cycle error, got {other:?}"),
            }
        }
    }

    describe "topological_order" {
        it "orders dependencies before dependents" {
            let base = unit(feature_id, Lane::Planned, Vec::new());
            let mid = unit(feature_id, Lane::Planned, vec![base.id]);
            let top = unit(feature_id, Lane::Planned, vec![mid.id, base.id]);

            let graph = DependencyGraph::build(&[top.clone(), base.clone(), mid.clone()]);
            let order = graph.topological_order().expect("acyclic");

            let pos = |id| order.iter().position(|x| *x == id).expect("in order");
            assert!(pos(base.id) < pos(mid.id));
            assert!(pos(mid.id) < pos(top.id));
        }

        it "is deterministic for independent units" {
            let a = unit(feature_id, Lane::Planned, Vec::new());
            let b = unit(feature_id, Lane::Planned, Vec::new());

            let graph = DependencyGraph::build(&[a.clone(), b.clone()]);
            let first = graph.topological_order().expect("acyclic");
            let second = graph.topological_order().expect("acyclic");
            assert_eq!(first, second);
            assert_eq!(first.len(), 2);
        }
    }

    describe "ready" {
        it "includes planned units with no dependencies" {
            let a = unit(feature_id, Lane::Planned, Vec::new());
            let graph = DependencyGraph::build(&[a.clone()]);
            assert_eq!(graph.ready(), vec![a.id]);
        }

        it "excludes units whose dependencies are not done" {
            let dep = unit(feature_id, Lane::Doing, Vec::new());
            let blocked = unit(feature_id, Lane::Planned, vec![dep.id]);

            let graph = DependencyGraph::build(&[dep, blocked.clone()]);
            assert!(!graph.ready().contains(&blocked.id));
        }

        it "includes units once every dependency is done" {
            let dep = unit(feature_id, Lane::Done, Vec::new());
            let next = unit(feature_id, Lane::Planned, vec![dep.id]);

            let graph = DependencyGraph::build(&[dep, next.clone()]);
            assert!(graph.ready().contains(&next.id));
        }

        it "excludes held units even when dependencies are done" {
            let mut parked = unit(feature_id, Lane::Planned, Vec::new());
            parked.hold = Some(Hold::Blocked);

            let graph = DependencyGraph::build(&[parked.clone()]);
            assert!(graph.ready().is_empty());
        }

        it "excludes claimed lanes" {
            let doing = unit(feature_id, Lane::Doing, Vec::new());
            let graph = DependencyGraph::build(&[doing]);
            assert!(graph.ready().is_empty());
        }
    }

    describe "unmet_dependencies" {
        it "names each dependency with its current lane" {
            let waiting = unit(feature_id, Lane::Doing, Vec::new());
            let finished = unit(feature_id, Lane::Done, Vec::new());
            let dependent = unit(feature_id, Lane::Planned, vec![waiting.id, finished.id]);

            let graph = DependencyGraph::build(&[waiting.clone(), finished, dependent.clone()]);
            let unmet = graph.unmet_dependencies(dependent.id);
            assert_eq!(unmet, vec![(waiting.id, Lane::Doing)]);
        }

        it "treats a held dependency as unmet" {
            let mut parked = unit(feature_id, Lane::Planned, Vec::new());
            parked.hold = Some(Hold::Blocked);
            let dependent = unit(feature_id, Lane::Planned, vec![parked.id]);

            let graph = DependencyGraph::build(&[parked.clone(), dependent.clone()]);
            assert_eq!(
                graph.unmet_dependencies(dependent.id),
                vec![(parked.id, Lane::Planned)]
            );
        }
    }

    describe "orphans" {
        it "is empty when every unit is reachable from a root" {
            let root = unit(feature_id, Lane::Planned, Vec::new());
            let leaf = unit(feature_id, Lane::Planned, vec![root.id]);

            let graph = DependencyGraph::build(&[root, leaf]);
            assert!(graph.orphans().is_empty());
        }
    }
}
