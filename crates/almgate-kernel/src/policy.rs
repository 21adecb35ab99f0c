//! Mediation policy.
//!
//! One immutable value consulted by the grammar validator and the call
//! planner. Loaded once per process (TOML) and shared behind an `Arc`.
//! There is no retry setting; dispatch never retries. Bulk preference and
//! the relation predicate set are fixed: a policy may narrow the allowed
//! predicates but never add to them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_ALLOWED_PREDICATES: &[&str] = &["hasLinkTo", "hasParent", "hasChild"];
pub const DEFAULT_FORBIDDEN_KEYWORDS: &[&str] =
    &["SELECT", "UPDATE", "DELETE", "INSERT", "JOIN", "FROM"];
/// Targets sharing one payload at or above this count go out as one bulk
/// update.
pub const BULK_MIN_TARGETS: usize = 2;
pub const DEFAULT_QUERY_PAGE_SIZE: u32 = 500;
pub const DEFAULT_MAX_QUERY_PAGES: u32 = 200;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid policy: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Relation predicates a query may use. Exact, case-sensitive names,
    /// drawn from [`DEFAULT_ALLOWED_PREDICATES`].
    pub allowed_predicates: Vec<String>,
    /// Words that mark SQL-style constructs. Matched case-insensitively.
    pub forbidden_keywords: Vec<String>,
    /// Page size used when draining a query.
    pub query_page_size: u32,
    /// A query still returning full pages after this many is abandoned.
    pub max_query_pages: u32,
    /// Ask the remote to apply bulk updates all-or-nothing.
    pub atomic_bulk_updates: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_predicates: DEFAULT_ALLOWED_PREDICATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            forbidden_keywords: DEFAULT_FORBIDDEN_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            query_page_size: DEFAULT_QUERY_PAGE_SIZE,
            max_query_pages: DEFAULT_MAX_QUERY_PAGES,
            atomic_bulk_updates: true,
        }
    }
}

impl PolicyConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, PolicyError> {
        let policy: Self = toml::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.allowed_predicates.is_empty() {
            return Err(PolicyError::Invalid(
                "allowed_predicates must name at least one predicate".to_string(),
            ));
        }
        if let Some(blank) = self
            .allowed_predicates
            .iter()
            .chain(self.forbidden_keywords.iter())
            .find(|entry| entry.trim().is_empty())
        {
            return Err(PolicyError::Invalid(format!(
                "blank entry `{blank}` in predicate or keyword list"
            )));
        }
        if let Some(extra) = self
            .allowed_predicates
            .iter()
            .find(|p| !DEFAULT_ALLOWED_PREDICATES.contains(&p.as_str()))
        {
            return Err(PolicyError::Invalid(format!(
                "allowed_predicates may only narrow {}; `{extra}` is not a relation predicate",
                DEFAULT_ALLOWED_PREDICATES.join(", ")
            )));
        }
        if self.query_page_size == 0 {
            return Err(PolicyError::Invalid(
                "query_page_size must be positive".to_string(),
            ));
        }
        if self.max_query_pages == 0 {
            return Err(PolicyError::Invalid(
                "max_query_pages must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn allows_predicate(&self, name: &str) -> bool {
        self.allowed_predicates.iter().any(|p| p == name)
    }

    /// The allowed spelling of `name`, if it differs only by case.
    pub fn canonical_predicate(&self, name: &str) -> Option<&str> {
        self.allowed_predicates
            .iter()
            .find(|p| p.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    pub fn is_forbidden_keyword(&self, word: &str) -> bool {
        self.forbidden_keywords
            .iter()
            .any(|k| k.eq_ignore_ascii_case(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let policy = PolicyConfig::from_toml_str("").expect("defaults are valid");
        assert_eq!(policy, PolicyConfig::default());
        assert!(policy.allows_predicate("hasLinkTo"));
        assert!(!policy.allows_predicate("haslinkto"));
        assert_eq!(policy.canonical_predicate("HASPARENT"), Some("hasParent"));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let policy = PolicyConfig::from_toml_str(
            "max_query_pages = 3\nforbidden_keywords = [\"select\"]\n",
        )
        .expect("valid policy");
        assert_eq!(policy.max_query_pages, 3);
        assert!(policy.is_forbidden_keyword("SELECT"));
        assert!(!policy.is_forbidden_keyword("JOIN"));
        assert_eq!(policy.query_page_size, DEFAULT_QUERY_PAGE_SIZE);
    }

    #[test]
    fn bulk_preference_is_not_configurable() {
        for raw in ["bulk_threshold = 3", "bulk_threshold = 1"] {
            let err = PolicyConfig::from_toml_str(raw).expect_err("must reject");
            assert!(matches!(err, PolicyError::Parse(_)), "{raw}");
        }
    }

    #[test]
    fn allow_list_may_narrow_predicates() {
        let policy = PolicyConfig::from_toml_str("allowed_predicates = [\"hasLinkTo\"]")
            .expect("subset is valid");
        assert!(policy.allows_predicate("hasLinkTo"));
        assert!(!policy.allows_predicate("hasParent"));
    }

    #[test]
    fn allow_list_may_not_add_predicates() {
        let err = PolicyConfig::from_toml_str(
            "allowed_predicates = [\"hasLinkTo\", \"hasParent\", \"hasChild\", \"hasSibling\"]",
        )
        .expect_err("must reject");
        assert!(matches!(err, PolicyError::Invalid(_)));
        assert!(err.to_string().contains("hasSibling"));
    }

    #[test]
    fn rejects_zero_page_limits() {
        for raw in ["query_page_size = 0", "max_query_pages = 0"] {
            let err = PolicyConfig::from_toml_str(raw).expect_err("must reject");
            assert!(matches!(err, PolicyError::Invalid(_)), "{raw}");
        }
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = PolicyConfig::from_toml_str("auto_retry = true").expect_err("must reject");
        assert!(matches!(err, PolicyError::Parse(_)));
    }

    #[test]
    fn rejects_empty_predicate_list() {
        let err =
            PolicyConfig::from_toml_str("allowed_predicates = []").expect_err("must reject");
        assert!(err.to_string().contains("allowed_predicates"));
    }
}
