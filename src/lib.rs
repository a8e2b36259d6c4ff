//! Worksmith: a filesystem-backed work-unit orchestration engine.
//!
//! Features are planned as graphs of work units. Units move through a small
//! lane machine (`planned → doing → for_review → done`) under per-unit
//! filesystem locks, every change is appended to a per-workspace event
//! stream, and streams from different workspaces merge into one canonical
//! log by event id. The whole surface is exposed through versioned protocol
//! envelopes; see the [`protocol`] module.

pub mod error;
pub mod eventlog;
pub mod graph;
pub mod lifecycle;
pub mod lock;
pub mod models;
pub mod protocol;
pub mod store;
pub mod vcs;

pub use error::{EngineError, ErrorCode};
pub use protocol::{Envelope, Orchestrator, Request, CONTRACT_VERSION};
pub use store::WorkRoot;
