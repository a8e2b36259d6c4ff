//! Filesystem persistence for features and work units.
//!
//! Layout under the work root:
//!
//! ```text
//! <root>/config.json
//! <root>/features/<feature_id>/feature.json
//! <root>/features/<feature_id>/units/<unit_id>.json
//! <root>/features/<feature_id>/events/<workspace>.jsonl
//! <root>/features/<feature_id>/events/merged.jsonl
//! <root>/locks/{units,features,config}/<id>.lock
//! ```
//!
//! Every record write goes through [`atomic_write`] (temp file in the target
//! directory, then rename), so a concurrent reader never observes a partial
//! record and a crash mid-write leaves the previous version intact.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::eventlog::EventLog;
use crate::graph::DependencyGraph;
use crate::models::{Feature, Lane, PlanFeatureInput, Subtask, WorkUnit};

/// Environment variable overriding the work root directory.
pub const ROOT_ENV_VAR: &str = "WORKSMITH_ROOT";

/// Environment variable naming this process's contributing workspace.
pub const WORKSPACE_ENV_VAR: &str = "WORKSMITH_WORKSPACE";

/// Project-level configuration, stored at `<root>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    /// Allow a unit's assignee to approve their own review.
    pub allow_self_review: bool,
    /// Default lock acquisition timeout when a request does not carry one.
    pub lock_timeout_secs: u64,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            allow_self_review: false,
            lock_timeout_secs: 30,
        }
    }
}

/// The resolved work root plus this process's workspace identity.
#[derive(Debug, Clone)]
pub struct WorkRoot {
    root: PathBuf,
    workspace: String,
}

impl WorkRoot {
    /// Resolve the root from `WORKSMITH_ROOT`, falling back to the platform
    /// data directory.
    pub fn discover() -> Result<Self, EngineError> {
        if let Some(dir) = std::env::var_os(ROOT_ENV_VAR) {
            if !dir.is_empty() {
                return Ok(Self::at(PathBuf::from(dir)));
            }
        }
        let dirs = directories::ProjectDirs::from("", "", "worksmith").ok_or_else(|| {
            EngineError::Usage("could not determine data directory; set WORKSMITH_ROOT".into())
        })?;
        Ok(Self::at(dirs.data_dir().to_path_buf()))
    }

    pub fn at(root: PathBuf) -> Self {
        let workspace = std::env::var(WORKSPACE_ENV_VAR)
            .ok()
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| "local".to_string());
        Self { root, workspace }
    }

    pub fn with_workspace(mut self, workspace: impl Into<String>) -> Self {
        self.workspace = workspace.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    // ============================================================
    // Layout
    // ============================================================

    fn features_dir(&self) -> PathBuf {
        self.root.join("features")
    }

    fn feature_dir(&self, feature_id: Uuid) -> PathBuf {
        self.features_dir().join(feature_id.to_string())
    }

    fn feature_path(&self, feature_id: Uuid) -> PathBuf {
        self.feature_dir(feature_id).join("feature.json")
    }

    fn units_dir(&self, feature_id: Uuid) -> PathBuf {
        self.feature_dir(feature_id).join("units")
    }

    fn unit_path(&self, feature_id: Uuid, unit_id: Uuid) -> PathBuf {
        self.units_dir(feature_id)
            .join(format!("{unit_id}.json"))
    }

    /// The event log for one feature, writing to this workspace's stream.
    pub fn event_log(&self, feature_id: Uuid) -> EventLog {
        EventLog::new(self.feature_dir(feature_id).join("events"), &self.workspace)
    }

    // ============================================================
    // Config
    // ============================================================

    pub fn load_config(&self) -> Result<RootConfig, EngineError> {
        match read_json(&self.root.join("config.json")) {
            Ok(Some(config)) => Ok(config),
            Ok(None) => Ok(RootConfig::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save_config(&self, config: &RootConfig) -> Result<(), EngineError> {
        write_json(&self.root.join("config.json"), config)
    }

    // ============================================================
    // Features
    // ============================================================

    /// Plan a new feature with its complete unit set.
    ///
    /// The declared dependency graph is validated first: a cycle, a
    /// self-dependency, or an unknown key fails the call before anything is
    /// persisted.
    pub fn create_feature(
        &self,
        input: PlanFeatureInput,
    ) -> Result<(Feature, Vec<WorkUnit>), EngineError> {
        if input.title.trim().is_empty() {
            return Err(EngineError::Usage("feature title must not be empty".into()));
        }

        let feature = Feature {
            id: Uuid::new_v4(),
            title: input.title,
            created_at: Utc::now(),
        };

        let mut ids: BTreeMap<String, Uuid> = BTreeMap::new();
        for unit in &input.units {
            if ids.insert(unit.key.clone(), Uuid::new_v4()).is_some() {
                return Err(EngineError::Usage(format!(
                    "duplicate unit key '{}' in plan",
                    unit.key
                )));
            }
        }

        let now = Utc::now();
        let mut units = Vec::with_capacity(input.units.len());
        for unit in input.units {
            let depends_on = unit
                .depends_on
                .iter()
                .map(|key| {
                    ids.get(key).copied().ok_or_else(|| {
                        EngineError::Usage(format!(
                            "unit '{}' depends on unknown key '{key}'",
                            unit.key
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            units.push(WorkUnit {
                id: ids[&unit.key],
                feature_id: feature.id,
                title: unit.title,
                lane: Lane::Planned,
                hold: None,
                depends_on,
                subtasks: unit
                    .subtasks
                    .into_iter()
                    .map(|title| Subtask { title, done: false })
                    .collect(),
                assignee: None,
                agent: None,
                notes: unit.notes,
                feedback_ref: None,
                branch: None,
                workspace: None,
                history: Vec::new(),
                pending_event: None,
                created_at: now,
                updated_at: now,
            });
        }

        DependencyGraph::build(&units).validate()?;

        write_json(&self.feature_path(feature.id), &feature)?;
        for unit in &units {
            write_json(&self.unit_path(feature.id, unit.id), unit)?;
        }
        tracing::debug!(feature_id = %feature.id, units = units.len(), "feature planned");
        Ok((feature, units))
    }

    pub fn load_feature(&self, feature_id: Uuid) -> Result<Feature, EngineError> {
        read_json(&self.feature_path(feature_id))?
            .ok_or(EngineError::FeatureNotFound(feature_id))
    }

    pub fn list_features(&self) -> Result<Vec<Feature>, EngineError> {
        let mut features = Vec::new();
        for dir in self.scan_dirs(&self.features_dir())? {
            if let Some(feature) = read_json(&dir.join("feature.json"))? {
                features.push(feature);
            }
        }
        features.sort_by_key(|f: &Feature| f.created_at);
        Ok(features)
    }

    // ============================================================
    // Units
    // ============================================================

    pub fn load_unit(&self, feature_id: Uuid, unit_id: Uuid) -> Result<WorkUnit, EngineError> {
        read_json(&self.unit_path(feature_id, unit_id))?.ok_or(EngineError::UnitNotFound(unit_id))
    }

    /// Locate a unit by id alone, scanning across features. Protocol calls
    /// carry only the unit id.
    pub fn find_unit(&self, unit_id: Uuid) -> Result<WorkUnit, EngineError> {
        for dir in self.scan_dirs(&self.features_dir())? {
            let candidate = dir.join("units").join(format!("{unit_id}.json"));
            if let Some(unit) = read_json(&candidate)? {
                return Ok(unit);
            }
        }
        Err(EngineError::UnitNotFound(unit_id))
    }

    pub fn list_units(&self, feature_id: Uuid) -> Result<Vec<WorkUnit>, EngineError> {
        // Missing feature directory is FEATURE_NOT_FOUND, not an empty list.
        self.load_feature(feature_id)?;
        let mut units: Vec<WorkUnit> = Vec::new();
        let dir = self.units_dir(feature_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(units),
            Err(e) => return Err(EngineError::io(format!("listing {}", dir.display()), e)),
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| EngineError::io(format!("listing {}", dir.display()), e))?;
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                if let Some(unit) = read_json::<WorkUnit>(&entry.path())? {
                    units.push(unit);
                }
            }
        }
        units.sort_by_key(|u| u.id);
        Ok(units)
    }

    pub fn save_unit(&self, unit: &WorkUnit) -> Result<(), EngineError> {
        write_json(&self.unit_path(unit.feature_id, unit.id), unit)
    }

    /// Project a staged event into the workspace stream.
    ///
    /// A crash between a record commit and its stream append leaves the
    /// event staged on the record; this replays it under the caller's lock.
    /// The append is skipped when the stream already carries the event id,
    /// so the flush is idempotent.
    pub fn flush_pending_event(&self, unit: &mut WorkUnit) -> Result<(), EngineError> {
        let Some(event) = unit.pending_event.take() else {
            return Ok(());
        };
        let log = self.event_log(unit.feature_id);
        if !log.stream_contains(event.id)? {
            log.append(&event)?;
        }
        self.save_unit(unit)
    }

    fn scan_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::io(format!("listing {}", dir.display()), e)),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| EngineError::io(format!("listing {}", dir.display()), e))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

// ============================================================
// Record I/O
// ============================================================

/// Write `data` to `target` via a temp file in the same directory followed
/// by an atomic rename. Readers see the old record or the new one, never a
/// mix.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<(), EngineError> {
    let parent = target.parent().ok_or_else(|| {
        EngineError::io(
            format!("path has no parent: {}", target.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "no parent directory"),
        )
    })?;
    fs::create_dir_all(parent)
        .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;

    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| EngineError::io(format!("creating temp file in {}", parent.display()), e))?;
    let mut file = temp.as_file();
    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|e| EngineError::io(format!("writing temp file for {}", target.display()), e))?;
    temp.persist(target)
        .map_err(|e| EngineError::io(format!("replacing {}", target.display()), e.error))?;
    Ok(())
}

fn write_json<T: Serialize>(target: &Path, value: &T) -> Result<(), EngineError> {
    let mut body = serde_json::to_vec_pretty(value).map_err(|e| EngineError::CorruptRecord {
        path: target.to_path_buf(),
        detail: format!("record failed to serialize: {e}"),
    })?;
    body.push(b'\n');
    atomic_write(target, &body)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, EngineError> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::io(format!("reading {}", path.display()), e)),
    };
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| EngineError::CorruptRecord {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}
