//! Append-only, per-feature event streams.
//!
//! Each feature owns one logical stream, physically one JSONL file per
//! contributing workspace plus a canonical merged view. A record is one
//! self-contained JSON object per line, independently parseable. Merging
//! collects every record from every stream, dedupes by event id, sorts by
//! id, and atomically rewrites the canonical view. The merge is idempotent
//! and order-independent with respect to which stream is read first.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::EngineError;
use crate::models::Event;
use crate::store::atomic_write;

/// Filename of the canonical merged view.
const MERGED_STREAM: &str = "merged.jsonl";

/// One feature's event stream directory, scoped to a contributing workspace.
#[derive(Debug, Clone)]
pub struct EventLog {
    dir: PathBuf,
    workspace: String,
}

impl EventLog {
    pub fn new(events_dir: PathBuf, workspace: impl Into<String>) -> Self {
        Self {
            dir: events_dir,
            workspace: workspace.into(),
        }
    }

    fn workspace_stream(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.workspace))
    }

    /// Append one event to this workspace's stream. The record is written as
    /// a single newline-terminated line; nothing already written is touched.
    pub fn append(&self, event: &Event) -> Result<(), EngineError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| EngineError::io(format!("creating {}", self.dir.display()), e))?;
        let path = self.workspace_stream();
        let mut line = serde_json::to_string(event).map_err(|e| EngineError::CorruptRecord {
            path: path.clone(),
            detail: format!("event failed to serialize: {e}"),
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::io(format!("opening stream {}", path.display()), e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| EngineError::io(format!("appending to {}", path.display()), e))
    }

    /// Read every record from one stream file, in file order.
    pub fn read_stream(path: &Path) -> Result<Vec<Event>, EngineError> {
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::io(
                    format!("reading stream {}", path.display()),
                    e,
                ))
            }
        };
        let mut events = Vec::new();
        for (lineno, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event =
                serde_json::from_str(line).map_err(|e| EngineError::CorruptRecord {
                    path: path.to_path_buf(),
                    detail: format!("line {}: {e}", lineno + 1),
                })?;
            events.push(event);
        }
        Ok(events)
    }

    /// The canonical merged history: every contributing stream plus any
    /// previous merged view, deduplicated by id and sorted by id.
    ///
    /// Running this on an already-merged directory changes nothing, and the
    /// result does not depend on stream read order; ids are unique and the
    /// sort key is the id itself.
    pub fn merge(&self) -> Result<Vec<Event>, EngineError> {
        let mut by_id: BTreeMap<Uuid, Event> = BTreeMap::new();
        for path in self.stream_paths()? {
            for event in Self::read_stream(&path)? {
                by_id.entry(event.id).or_insert(event);
            }
        }
        let merged: Vec<Event> = by_id.into_values().collect();

        let mut body = String::new();
        for event in &merged {
            body.push_str(&serde_json::to_string(event).map_err(|e| {
                EngineError::CorruptRecord {
                    path: self.dir.join(MERGED_STREAM),
                    detail: format!("event failed to serialize: {e}"),
                }
            })?);
            body.push('\n');
        }
        atomic_write(&self.dir.join(MERGED_STREAM), body.as_bytes())?;
        Ok(merged)
    }

    /// Export-time hook for a package boundary: if this workspace's stream
    /// carries no events yet, synthesize a single bootstrap record so every
    /// exported stream is non-empty and names its scope.
    pub fn ensure_bootstrapped(&self, feature_id: Uuid) -> Result<(), EngineError> {
        if Self::read_stream(&self.workspace_stream())?.is_empty() {
            self.append(&Event::bootstrap(feature_id, &self.workspace))?;
        }
        Ok(())
    }

    /// Whether this workspace's stream already carries the given event id.
    pub fn stream_contains(&self, id: Uuid) -> Result<bool, EngineError> {
        Ok(Self::read_stream(&self.workspace_stream())?
            .iter()
            .any(|e| e.id == id))
    }

    fn stream_paths(&self) -> Result<Vec<PathBuf>, EngineError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::io(
                    format!("listing streams in {}", self.dir.display()),
                    e,
                ))
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| EngineError::io(format!("listing {}", self.dir.display()), e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}
