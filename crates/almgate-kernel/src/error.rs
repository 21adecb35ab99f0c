//! Error taxonomy surfaced to callers.
//!
//! Only validation errors are ever repaired, and only once, during planning.
//! Everything else propagates immediately and is never retried.

use crate::call::ToolKind;
use crate::grammar::GrammarRejection;
use crate::identifier::{CallId, IdentifierKind, Reference};
use serde::Serialize;

pub const KIND_VALIDATION: &str = "validation_error";
pub const KIND_UNRESOLVABLE_REFERENCE: &str = "unresolvable_reference";
pub const KIND_ORDERING_VIOLATION: &str = "ordering_violation";
pub const KIND_HALTED: &str = "halted";
pub const KIND_ADAPTER: &str = "adapter_error";
pub const KIND_INVALID_INTENT: &str = "invalid_intent";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OrchestratorError {
    /// Grammar/scope violation that survived the local correction pass, or
    /// a query the remote rejected as invalid.
    #[error("ValidationError: {rejection} (query: {expression})")]
    #[serde(rename = "validation_error")]
    Validation {
        rejection: ValidationFailure,
        expression: String,
        corrected: bool,
    },

    #[error("UnresolvableReference: {kind} {reference}: {reason}")]
    UnresolvableReference {
        #[serde(rename = "identifier")]
        kind: IdentifierKind,
        reference: Reference,
        reason: String,
    },

    /// A planner bug. Never corrected, never user-recoverable.
    #[error("OrderingViolation at {call_id}: {detail}")]
    OrderingViolation { call_id: CallId, detail: String },

    #[error(
        "HaltedError: rate limited, {seconds_remaining}s remaining; dispatch is stopped until the session is reset"
    )]
    Halted { seconds_remaining: u64 },

    /// Transport or remote failure, reported verbatim.
    #[error("AdapterError from {tool}: {message}")]
    #[serde(rename = "adapter_error")]
    Adapter { tool: ToolKind, message: String },

    /// The request itself is malformed (unknown read label, comment on a
    /// result set, empty target list). Nothing was planned.
    #[error("InvalidIntent: {detail}")]
    InvalidIntent { detail: String },
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => KIND_VALIDATION,
            Self::UnresolvableReference { .. } => KIND_UNRESOLVABLE_REFERENCE,
            Self::OrderingViolation { .. } => KIND_ORDERING_VIOLATION,
            Self::Halted { .. } => KIND_HALTED,
            Self::Adapter { .. } => KIND_ADAPTER,
            Self::InvalidIntent { .. } => KIND_INVALID_INTENT,
        }
    }

    pub fn unresolvable(
        kind: IdentifierKind,
        reference: Reference,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnresolvableReference {
            kind,
            reference,
            reason: reason.into(),
        }
    }

    pub fn invalid_intent(detail: impl Into<String>) -> Self {
        Self::InvalidIntent {
            detail: detail.into(),
        }
    }

    pub fn ordering(call_id: CallId, detail: impl Into<String>) -> Self {
        Self::OrderingViolation {
            call_id,
            detail: detail.into(),
        }
    }
}

/// Why a query was judged invalid: locally by the grammar, or by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ValidationFailure {
    #[error("{0}")]
    Grammar(GrammarRejection),

    #[error("remote rejected query: {message}")]
    Remote { message: String },
}

impl ValidationFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Grammar(rejection) => rejection.reason(),
            Self::Remote { .. } => "remote_invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_error_names_its_kind() {
        let halted = OrchestratorError::Halted {
            seconds_remaining: 30,
        };
        assert_eq!(halted.kind(), "halted");
        assert!(halted.to_string().starts_with("HaltedError"));
        assert!(halted.to_string().contains("30s"));

        let unresolved = OrchestratorError::unresolvable(
            IdentifierKind::Item,
            Reference::id(100),
            "items are only known from query results",
        );
        assert_eq!(unresolved.kind(), "unresolvable_reference");
        assert!(unresolved.to_string().starts_with("UnresolvableReference: item #100"));
    }

    #[test]
    fn unresolvable_reference_keeps_the_kind_tag_unique() {
        let err = OrchestratorError::unresolvable(
            IdentifierKind::Tracker,
            Reference::name("Bugs"),
            "2 trackers match",
        );
        assert_eq!(
            serde_json::to_value(&err).expect("serializable"),
            json!({
                "kind": "unresolvable_reference",
                "identifier": "tracker",
                "reference": {"name": "Bugs"},
                "reason": "2 trackers match"
            })
        );
    }

    #[test]
    fn multi_word_fields_serialize_camel_case() {
        assert_eq!(
            serde_json::to_value(OrchestratorError::Halted {
                seconds_remaining: 30
            })
            .expect("serializable"),
            json!({"kind": "halted", "secondsRemaining": 30})
        );
        assert_eq!(
            serde_json::to_value(OrchestratorError::ordering(CallId::new(3), "expansion first"))
                .expect("serializable"),
            json!({"kind": "ordering_violation", "callId": 3, "detail": "expansion first"})
        );
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = OrchestratorError::Validation {
            rejection: ValidationFailure::Grammar(GrammarRejection::ScopeMissing { found: 0 }),
            expression: "status = 'Open'".to_string(),
            corrected: false,
        };
        assert_eq!(
            serde_json::to_value(&err).expect("serializable"),
            json!({
                "kind": "validation_error",
                "rejection": {"source": "grammar", "reason": "scope_missing", "found": 0},
                "expression": "status = 'Open'",
                "corrected": false
            })
        );
    }
}
