//! Domain models for Worksmith.
//!
//! # Core Concepts
//!
//! - [`Feature`]: The scope that owns a set of work units sharing one
//!   dependency graph and one event stream. Created once at planning time;
//!   its unit set is fixed after creation.
//! - [`WorkUnit`]: The atomic schedulable piece of work, tracked through
//!   lanes (`planned → doing → for_review → done`). Never deleted, only
//!   transitioned.
//! - [`Event`]: An immutable fact appended to a feature's history. Event ids
//!   are time-sortable, so streams written by independent workspaces merge
//!   deterministically.
//! - [`PolicyDescriptor`]: Caller-supplied metadata describing the calling
//!   automation's identity and safety posture, validated before any mutating
//!   call proceeds.

mod event;
mod feature;
mod policy;
mod unit;

pub use event::*;
pub use feature::*;
pub use policy::*;
pub use unit::*;
