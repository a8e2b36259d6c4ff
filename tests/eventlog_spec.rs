use std::fs;

use speculate2::speculate;
use tempfile::TempDir;
use uuid::Uuid;
use worksmith::error::EngineError;
use worksmith::eventlog::EventLog;
use worksmith::models::{Event, EventKind};

fn note(feature_id: Uuid, text: &str) -> Event {
    Event::new(
        feature_id,
        None,
        EventKind::Note,
        "agent-a",
        serde_json::json!({ "note": text }),
    )
}

speculate! {
    before {
        let dir = TempDir::new().expect("temp dir");
        let feature_id = Uuid::new_v4();
        let alpha = EventLog::new(dir.path().to_path_buf(), "alpha");
        let beta = EventLog::new(dir.path().to_path_buf(), "beta");
    }

    describe "append" {
        it "writes one self-contained record per line" {
            alpha.append(&note(feature_id, "first")).expect("append");
            alpha.append(&note(feature_id, "second")).expect("append");

            let body = fs::read_to_string(dir.path().join("alpha.jsonl")).expect("stream");
            let lines: Vec<&str> = body.lines().collect();
            assert_eq!(lines.len(), 2);
            for line in lines {
                serde_json::from_str::<Event>(line).expect("independently parseable");
            }
        }

        it "never rewrites earlier records" {
            alpha.append(&note(feature_id, "first")).expect("append");
            let before = fs::read_to_string(dir.path().join("alpha.jsonl")).expect("stream");

            alpha.append(&note(feature_id, "second")).expect("append");
            let after = fs::read_to_string(dir.path().join("alpha.jsonl")).expect("stream");
            assert!(after.starts_with(&before));
        }
    }

    describe "read_stream" {
        it "returns empty for a missing stream" {
            let events = EventLog::read_stream(&dir.path().join("absent.jsonl")).expect("read");
            assert!(events.is_empty());
        }

        it "names the offending line of a corrupt stream" {
            alpha.append(&note(feature_id, "good")).expect("append");
            let path = dir.path().join("alpha.jsonl");
            let mut body = fs::read_to_string(&path).expect("stream");
            body.push_str("{ broken\n");
            fs::write(&path, body).expect("rewrite");

            match EventLog::read_stream(&path) {
                Err(EngineError::CorruptRecord { detail, .. }) => {
                    assert!(detail.contains("line 2"), "detail was: {detail}");
                }
                other => panic!("expected corrupt record, got {other:?}"),
            }
        }
    }

    describe "merge" {
        it "interleaves records from concurrent workspaces by id" {
            let e1 = note(feature_id, "e1");
            let e2 = note(feature_id, "e2");
            let e3 = note(feature_id, "e3");
            let e4 = note(feature_id, "e4");

            alpha.append(&e1).expect("append");
            beta.append(&e2).expect("append");
            alpha.append(&e3).expect("append");
            beta.append(&e4).expect("append");

            let merged = alpha.merge().expect("merge");
            let ids: Vec<Uuid> = merged.iter().map(|e| e.id).collect();
            assert_eq!(ids, vec![e1.id, e2.id, e3.id, e4.id]);
        }

        it "drops duplicate ids across streams" {
            let shared = note(feature_id, "shared");
            alpha.append(&shared).expect("append");
            beta.append(&shared).expect("append");

            let merged = alpha.merge().expect("merge");
            assert_eq!(merged.len(), 1);
        }

        it "is idempotent over its own output" {
            alpha.append(&note(feature_id, "one")).expect("append");
            beta.append(&note(feature_id, "two")).expect("append");

            let first = alpha.merge().expect("merge");
            let second = alpha.merge().expect("merge again");
            let third = beta.merge().expect("merge from the other side");

            let ids = |events: &[Event]| events.iter().map(|e| e.id).collect::<Vec<_>>();
            assert_eq!(ids(&first), ids(&second));
            assert_eq!(ids(&first), ids(&third));
        }

        it "merges an empty directory to an empty canonical view" {
            let merged = alpha.merge().expect("merge");
            assert!(merged.is_empty());
        }
    }

    describe "ensure_bootstrapped" {
        it "synthesizes a bootstrap record for an empty stream" {
            alpha.ensure_bootstrapped(feature_id).expect("bootstrap");

            let events =
                EventLog::read_stream(&dir.path().join("alpha.jsonl")).expect("read");
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::Bootstrap);
            assert_eq!(events[0].feature_id, feature_id);
        }

        it "leaves a non-empty stream untouched" {
            alpha.append(&note(feature_id, "real work")).expect("append");
            alpha.ensure_bootstrapped(feature_id).expect("bootstrap");

            let events =
                EventLog::read_stream(&dir.path().join("alpha.jsonl")).expect("read");
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind, EventKind::Note);
        }
    }
}
