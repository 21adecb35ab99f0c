//! # almgate kernel
//!
//! Stateless vocabulary for mediating an agent's calls into an ALM tracker:
//! what a query may say, which identifiers a call may use, and in which
//! order calls may run.
//!
//! ## Architecture
//!
//! ```text
//! PolicyConfig         ← immutable rules (predicates, keywords, paging)
//!     │
//! QueryExpression      ← CBQL token stream with identifier bindings
//!     │
//! grammar::validate    ← scope / predicate / construct / single-statement checks
//!     │
//! ToolCall             ← one tool kind + bound arguments
//!     │
//! Plan                 ← ordered calls, admitted only through gate::check_order
//! ```
//!
//! Session state (registry, rate-limit governor) and dispatch live in
//! `almgate-session`.

pub mod call;
pub mod cbql;
pub mod error;
pub mod gate;
pub mod grammar;
pub mod identifier;
pub mod plan;
pub mod policy;

pub use call::{CallArgs, ChangePayload, ItemAction, ItemSet, Phase, ToolCall, ToolKind};
pub use cbql::{QueryExpression, ScopeKind, Token};
pub use error::{OrchestratorError, ValidationFailure};
pub use gate::check_order;
pub use grammar::{
    Correction, CorrectionKind, GrammarRejection, ScopeHint, ValidatedQuery, correct, validate,
};
pub use identifier::{
    Binding, CallId, Identifier, IdentifierKind, Provenance, Reference, RemoteId,
};
pub use plan::{PLAN_DIGEST_PREFIX, Plan};
pub use policy::{BULK_MIN_TARGETS, PolicyConfig, PolicyError};
