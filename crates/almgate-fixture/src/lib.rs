//! In-memory ALM workspace for exercising almgate without a remote.
//!
//! A fixture is a JSON file listing projects (with trackers), items, and
//! optional scripted faults. [`FixtureAdapter`] serves it through the
//! [`almgate_session::ToolAdapter`] seam, evaluating CBQL locally and
//! applying writes in memory.

pub mod adapter;
pub mod eval;
pub mod workspace;

pub use adapter::{CallRecord, FixtureAdapter};
pub use eval::{EvalError, Filter, compile};
pub use workspace::{
    Fault, FixtureError, FixtureItem, FixtureProject, FixtureTracker, FixtureWorkspace,
};
