//! Grammar validator for CBQL read requests.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. the expression is not empty
//! 2. exactly one tracker/project scope clause
//! 3. every relational term is an allowed predicate
//! 4. no SQL-style construct (`SELECT`, `JOIN`, bare `*`, ...)
//! 5. a single statement (no `;`)
//!
//! [`validate`] is pure. [`correct`] is the one local repair pass the planner
//! may apply before validating a second and final time.

use crate::cbql::{QueryExpression, ScopeKind, Token};
use crate::identifier::Binding;
use crate::policy::PolicyConfig;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GrammarRejection {
    #[error("query expression is empty")]
    Empty,

    #[error("query must declare exactly one tracker or project scope clause, found {found}")]
    ScopeMissing { found: usize },

    #[error("unsupported relation predicate `{name}`; relations must use {allowed}")]
    UnsupportedPredicate { name: String, allowed: String },

    #[error("disallowed construct `{construct}`; CBQL is not SQL")]
    DisallowedConstruct { construct: String },

    #[error("{statements} statements submitted; write one self-contained query")]
    NotSingleQuery { statements: usize },
}

impl GrammarRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::ScopeMissing { .. } => "scope_missing",
            Self::UnsupportedPredicate { .. } => "unsupported_predicate",
            Self::DisallowedConstruct { .. } => "disallowed_construct",
            Self::NotSingleQuery { .. } => "not_single_query",
        }
    }
}

/// An expression that passed every grammar check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedQuery {
    expression: QueryExpression,
    scope: ScopeKind,
    predicates: Vec<String>,
}

impl ValidatedQuery {
    pub fn expression(&self) -> &QueryExpression {
        &self.expression
    }

    pub fn into_expression(self) -> QueryExpression {
        self.expression
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }

    pub fn predicates(&self) -> &[String] {
        &self.predicates
    }
}

pub fn validate(
    expression: &QueryExpression,
    policy: &PolicyConfig,
) -> Result<ValidatedQuery, GrammarRejection> {
    if expression.is_empty() {
        return Err(GrammarRejection::Empty);
    }

    let clauses = expression.scope_clauses();
    if clauses.len() != 1 {
        return Err(GrammarRejection::ScopeMissing {
            found: clauses.len(),
        });
    }

    let terms = expression.relational_terms();
    if let Some(term) = terms.iter().find(|t| !policy.allows_predicate(&t.name)) {
        return Err(GrammarRejection::UnsupportedPredicate {
            name: term.name.clone(),
            allowed: policy.allowed_predicates.join(", "),
        });
    }

    for token in expression.tokens() {
        match token {
            Token::Word(word) if policy.is_forbidden_keyword(word) => {
                return Err(GrammarRejection::DisallowedConstruct {
                    construct: word.to_ascii_uppercase(),
                });
            }
            Token::Star => {
                return Err(GrammarRejection::DisallowedConstruct {
                    construct: "*".to_string(),
                });
            }
            _ => {}
        }
    }

    if expression.semicolon_count() > 0 {
        return Err(GrammarRejection::NotSingleQuery {
            statements: expression.statement_count().max(2),
        });
    }

    Ok(ValidatedQuery {
        expression: expression.clone(),
        scope: clauses[0].kind,
        predicates: terms.into_iter().map(|t| t.name).collect(),
    })
}

/// Scope the planner can infer from the read's context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeHint {
    pub kind: ScopeKind,
    pub targets: Vec<Binding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    InjectedScope,
    PredicateCase,
    TrailingSemicolon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub expression: QueryExpression,
    pub applied: Vec<CorrectionKind>,
}

/// Apply every local repair that fits `rejection` in a single pass.
///
/// Returns `None` when nothing could be repaired; the caller must then
/// surface the original rejection. Repairs are mechanical: a trailing `;` is
/// dropped, a predicate spelled with the wrong case is respelled, and a
/// missing scope is injected from `hint`. Nothing is guessed.
pub fn correct(
    expression: &QueryExpression,
    rejection: &GrammarRejection,
    policy: &PolicyConfig,
    hint: Option<&ScopeHint>,
) -> Option<Correction> {
    let mut applied = Vec::new();
    let mut current = expression.clone();

    if current.semicolon_count() == 1 && current.tokens().last() == Some(&Token::Semicolon) {
        let mut tokens = current.into_tokens();
        tokens.pop();
        current = QueryExpression::from_tokens(tokens);
        applied.push(CorrectionKind::TrailingSemicolon);
    }

    let respelled: Vec<(usize, Token)> = current
        .relational_terms()
        .into_iter()
        .filter(|term| !policy.allows_predicate(&term.name))
        .filter_map(|term| {
            policy
                .canonical_predicate(&term.name)
                .map(|canonical| (term.name_index, Token::word(canonical)))
        })
        .collect();
    if !respelled.is_empty() {
        current = current.with_replacements(respelled);
        applied.push(CorrectionKind::PredicateCase);
    }

    let scope_missing = matches!(rejection, GrammarRejection::Empty)
        || current.scope_clauses().is_empty();
    if scope_missing {
        if let Some(hint) = hint.filter(|h| !h.targets.is_empty()) {
            current = current.scoped(hint.kind, &hint.targets);
            applied.push(CorrectionKind::InjectedScope);
        }
    }

    if applied.is_empty() {
        None
    } else {
        Some(Correction {
            expression: current,
            applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::ToolKind;
    use crate::identifier::{CallId, Identifier, IdentifierKind, Provenance, RemoteId};

    fn policy() -> PolicyConfig {
        PolicyConfig::default()
    }

    fn check(src: &str) -> Result<ValidatedQuery, GrammarRejection> {
        validate(&QueryExpression::parse(src), &policy())
    }

    fn tracker_hint(id: u64) -> ScopeHint {
        ScopeHint {
            kind: ScopeKind::Tracker,
            targets: vec![Binding::Known(Identifier::observed(
                IdentifierKind::Tracker,
                RemoteId::new(id),
                Some("Requirements".to_string()),
                None,
                Provenance {
                    call_id: CallId::new(2),
                    tool: ToolKind::DiscoverTrackers,
                },
            ))],
        }
    }

    #[test]
    fn accepts_scoped_query_with_allowed_predicates() {
        let ok = check("tracker.id IN (42) AND hasLinkTo(100) AND status = 'Open'")
            .expect("valid query");
        assert_eq!(ok.scope(), ScopeKind::Tracker);
        assert_eq!(ok.predicates(), ["hasLinkTo".to_string()]);
    }

    #[test]
    fn rejects_blank_input_as_empty() {
        assert_eq!(check("   "), Err(GrammarRejection::Empty));
    }

    #[test]
    fn rejects_missing_scope() {
        assert_eq!(
            check("status = 'Open'"),
            Err(GrammarRejection::ScopeMissing { found: 0 })
        );
    }

    #[test]
    fn rejects_two_scope_clauses() {
        assert_eq!(
            check("tracker = 'A' AND project = 'B'"),
            Err(GrammarRejection::ScopeMissing { found: 2 })
        );
    }

    #[test]
    fn rejects_unknown_predicate() {
        let err = check("tracker = 'A' AND linkedTo(5)").expect_err("must reject");
        assert_eq!(err.reason(), "unsupported_predicate");
        assert!(err.to_string().contains("linkedTo"));
    }

    #[test]
    fn rejects_sql_constructs() {
        assert_eq!(
            check("tracker = 'A' AND id IN (SELECT id FROM items)"),
            Err(GrammarRejection::DisallowedConstruct {
                construct: "SELECT".to_string()
            })
        );
        let join = check("project = 'P' join tracker").expect_err("join is sql");
        assert_eq!(join.reason(), "disallowed_construct");
    }

    #[test]
    fn keyword_inside_string_literal_is_fine() {
        assert!(check("tracker = 'A' AND summary ~ 'please update docs'").is_ok());
    }

    #[test]
    fn rejects_batched_statements() {
        assert_eq!(
            check("tracker = 'A'; tracker = 'B'").unwrap_err().reason(),
            "scope_missing",
            "scope is checked before statement count"
        );
        assert_eq!(
            check("tracker = 'A' AND status = 'Open';"),
            Err(GrammarRejection::NotSingleQuery { statements: 2 })
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let expr = QueryExpression::parse("status = 'Open'");
        assert_eq!(validate(&expr, &policy()), validate(&expr, &policy()));
    }

    #[test]
    fn correction_injects_scope_from_hint() {
        let expr = QueryExpression::parse("status = 'Open'");
        let rejection = validate(&expr, &policy()).expect_err("unscoped");
        let fixed = correct(&expr, &rejection, &policy(), Some(&tracker_hint(42)))
            .expect("scope is inferable");
        assert_eq!(fixed.applied, vec![CorrectionKind::InjectedScope]);
        let ok = validate(&fixed.expression, &policy()).expect("valid after correction");
        assert_eq!(
            ok.expression().render().expect("bound"),
            "tracker.id IN (42) AND (status = 'Open')"
        );
    }

    #[test]
    fn correction_without_hint_gives_up() {
        let expr = QueryExpression::parse("status = 'Open'");
        let rejection = validate(&expr, &policy()).expect_err("unscoped");
        assert_eq!(correct(&expr, &rejection, &policy(), None), None);
    }

    #[test]
    fn correction_respells_predicates_and_drops_trailing_semicolon() {
        let expr = QueryExpression::parse("tracker = 'A' AND HASPARENT(9);");
        let rejection = validate(&expr, &policy()).expect_err("bad case");
        let fixed = correct(&expr, &rejection, &policy(), None).expect("repairable");
        assert_eq!(
            fixed.applied,
            vec![CorrectionKind::TrailingSemicolon, CorrectionKind::PredicateCase]
        );
        assert!(validate(&fixed.expression, &policy()).is_ok());
    }

    #[test]
    fn correction_never_touches_sql() {
        let expr = QueryExpression::parse("SELECT * FROM items");
        let rejection = validate(&expr, &policy()).expect_err("sql");
        let fixed = correct(&expr, &rejection, &policy(), Some(&tracker_hint(42)))
            .expect("scope still injected");
        let second = validate(&fixed.expression, &policy()).expect_err("still sql");
        assert_eq!(second.reason(), "disallowed_construct");
    }
}
