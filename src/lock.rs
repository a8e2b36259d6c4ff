//! Filesystem-based pessimistic locking.
//!
//! Holders are separate OS processes, so no in-process mutex is sufficient;
//! mutual exclusion rides on an exclusive marker file created with an atomic
//! create-or-fail open and released by deletion. A marker whose recorded
//! holder process is gone, or whose age exceeds twice its declared timeout,
//! is judged stale and reclaimed with a warning rather than an error.
//!
//! Granularity is layered: per-unit (finest), per-feature (graph-wide
//! operations), per-config (project metadata). Callers acquire coarse to
//! fine, so a coarser lock never deadlocks against a finer one held by the
//! same caller.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// How long to sleep between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the jitter added to each poll, to break lockstep between
/// contending processes.
const POLL_JITTER_MS: u64 = 50;

/// Which layer of the lock hierarchy a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Unit,
    Feature,
    Config,
}

impl LockScope {
    fn subdir(self) -> &'static str {
        match self {
            Self::Unit => "units",
            Self::Feature => "features",
            Self::Config => "config",
        }
    }
}

/// The persisted claim: who holds the resource, since when, for how long.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockMarker {
    resource: String,
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
    timeout_ms: u64,
}

/// RAII guard for a held lock. Dropping the guard deletes the marker;
/// [`LockGuard::release`] does the same but surfaces the error.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    resource: String,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn release(mut self) -> Result<(), EngineError> {
        self.released = true;
        fs::remove_file(&self.path)
            .map_err(|e| EngineError::io(format!("releasing lock '{}'", self.resource), e))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(resource = %self.resource, err = %e, "failed to release lock");
                }
            }
        }
    }
}

/// Creates and reclaims lock markers under `<root>/locks/`.
#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    pub fn new(root: &Path) -> Self {
        Self {
            locks_dir: root.join("locks"),
        }
    }

    fn marker_path(&self, scope: LockScope, resource: &Uuid) -> PathBuf {
        self.locks_dir
            .join(scope.subdir())
            .join(format!("{resource}.lock"))
    }

    /// Acquire the lock for `resource`, blocking up to `timeout`.
    ///
    /// Before each blocked retry the marker is checked for staleness; a
    /// stale marker is reclaimed and the reclamation logged as a warning.
    /// Exceeding `timeout` fails with [`EngineError::LockTimeout`], which
    /// the protocol reports as a retryable condition.
    pub fn acquire(
        &self,
        scope: LockScope,
        resource: Uuid,
        holder: &str,
        timeout: Duration,
    ) -> Result<LockGuard, EngineError> {
        let path = self.marker_path(scope, &resource);
        let resource_name = format!("{}/{resource}", scope.subdir());
        let started = Instant::now();

        loop {
            match self.try_create(&path, &resource_name, holder, timeout)? {
                Some(guard) => return Ok(guard),
                None => {
                    if self.reclaim_if_stale(&path, &resource_name)? {
                        continue;
                    }
                }
            }

            if started.elapsed() >= timeout {
                let current_holder = self
                    .read_marker(&path)
                    .ok()
                    .flatten()
                    .map(|m| m.holder)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(EngineError::LockTimeout {
                    resource: resource_name,
                    holder: current_holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % (POLL_JITTER_MS + 1));
            std::thread::sleep(POLL_INTERVAL.min(timeout) + jitter);
        }
    }

    /// Single non-blocking attempt. `Ok(None)` means the resource is held.
    pub fn try_acquire(
        &self,
        scope: LockScope,
        resource: Uuid,
        holder: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, EngineError> {
        let path = self.marker_path(scope, &resource);
        let resource_name = format!("{}/{resource}", scope.subdir());
        self.try_create(&path, &resource_name, holder, timeout)
    }

    fn try_create(
        &self,
        path: &Path,
        resource_name: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
        }

        // create_new is the atomic create-or-fail primitive: exactly one
        // contending process gets the marker.
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => {
                return Err(EngineError::io(
                    format!("creating lock marker {}", path.display()),
                    e,
                ))
            }
        };

        let marker = LockMarker {
            resource: resource_name.to_string(),
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            // Millisecond granularity: a sub-second timeout must not round
            // down to a zero stale bound.
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let body = match serde_json::to_string(&marker) {
            Ok(body) => body,
            Err(e) => {
                let _ = fs::remove_file(path);
                return Err(EngineError::CorruptRecord {
                    path: path.to_path_buf(),
                    detail: format!("lock marker failed to serialize: {e}"),
                });
            }
        };
        if let Err(e) = file.write_all(body.as_bytes()).and_then(|()| file.sync_all()) {
            // Marker exists but carries no claim; remove before bailing so
            // the resource is not wedged.
            let _ = fs::remove_file(path);
            return Err(EngineError::io(
                format!("writing lock marker {}", path.display()),
                e,
            ));
        }

        tracing::debug!(resource = %resource_name, holder, "lock acquired");
        Ok(Some(LockGuard {
            path: path.to_path_buf(),
            resource: resource_name.to_string(),
            released: false,
        }))
    }

    fn read_marker(&self, path: &Path) -> Result<Option<LockMarker>, EngineError> {
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::io(
                    format!("reading lock marker {}", path.display()),
                    e,
                ))
            }
        };
        Ok(serde_json::from_str(&body).ok())
    }

    /// Reclaim the marker if its holder is gone or it has outlived twice its
    /// declared timeout. Returns true when the marker was removed.
    fn reclaim_if_stale(&self, path: &Path, resource_name: &str) -> Result<bool, EngineError> {
        let Some(marker) = self.read_marker(path)? else {
            // Unparseable marker: either a torn write from a dead process or
            // a holder mid-write. Only reclaim once it is old enough that a
            // live writer would long since have finished.
            let old_enough = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age > Duration::from_secs(2));
            if old_enough {
                tracing::warn!(resource = %resource_name, "reclaiming unreadable lock marker");
                remove_marker(path)?;
                return Ok(true);
            }
            return Ok(false);
        };

        let age = Utc::now().signed_duration_since(marker.acquired_at);
        let max_age_ms = marker.timeout_ms.saturating_mul(2).min(i64::MAX as u64);
        let max_age = chrono::Duration::milliseconds(max_age_ms as i64);
        if age > max_age {
            tracing::warn!(
                resource = %resource_name,
                holder = %marker.holder,
                age_ms = age.num_milliseconds(),
                "reclaiming stale lock (age exceeds 2x declared timeout)"
            );
            remove_marker(path)?;
            return Ok(true);
        }

        if !process_alive(marker.pid) {
            tracing::warn!(
                resource = %resource_name,
                holder = %marker.holder,
                pid = marker.pid,
                "reclaiming stale lock (holder process is gone)"
            );
            remove_marker(path)?;
            return Ok(true);
        }

        Ok(false)
    }
}

fn remove_marker(path: &Path) -> Result<(), EngineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        // Lost the race to another reclaimer; that is fine.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(
            format!("reclaiming lock marker {}", path.display()),
            e,
        )),
    }
}

/// Check whether a pid refers to a live process.
///
/// `kill(pid, 0)` probes existence without signalling. EPERM means the
/// process exists but belongs to someone else; treat that as alive so stale
/// detection stays conservative.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 performs only an existence check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No portable probe; rely on the age bound alone.
    true
}
