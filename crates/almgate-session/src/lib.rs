//! Per-session orchestration on top of `almgate-kernel`.
//!
//! A [`Session`] owns the identifier registry and the rate-limit governor.
//! It plans intents with [`planner::plan_intent`] and runs plans through an
//! [`Execution`], one awaited tool call at a time.

pub mod adapter;
pub mod executor;
pub mod governor;
pub mod intent;
pub mod planner;
pub mod registry;
pub mod session;

pub use adapter::{
    AdapterFailure, AdapterResult, DEFAULT_RATE_LIMIT_SECONDS, DiscoveredEntity, ItemOutcome,
    ItemRecord, QueryPage, RelationDirection, RelationEdge, RelationGraph, ToolAdapter,
};
pub use executor::{Execution, RunReport, StepOutput, StepResult};
pub use governor::{RateLimitGovernor, RateLimitState};
pub use intent::{
    Change, Intent, IntentError, ReadRequest, RelationFilter, WriteRequest, WriteTargets,
};
pub use planner::plan_intent;
pub use registry::{DiscoveryScope, IdentifierRegistry, RecordOutcome, Resolution};
pub use session::{Session, SessionStatus};
