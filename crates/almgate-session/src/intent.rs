//! Intent: the structured read/write request the planner turns into a plan.
//!
//! The agent (or a human) hands over an intent as JSON. It names projects,
//! trackers, and items by [`Reference`]; none of those become identifiers
//! until the registry resolves them.

use almgate_kernel::{ChangePayload, Reference};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("failed to read intent {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse intent: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Intent {
    /// Project context for tracker discovery and scope inference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Reference>,
    pub reads: Vec<ReadRequest>,
    pub writes: Vec<WriteRequest>,
}

impl Intent {
    pub fn from_json_str(raw: &str) -> Result<Self, IntentError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IntentError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| IntentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }
}

/// One logically distinct read. Always planned as exactly one query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadRequest {
    /// Name later writes use to target this read's result set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Scope context: used only when the CBQL itself declares no scope.
    pub trackers: Vec<Reference>,
    pub projects: Vec<Reference>,
    pub cbql: String,
    /// Relation filters conjoined onto the CBQL as predicate terms.
    pub relations: Vec<RelationFilter>,
    pub expand_relations: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationFilter {
    pub predicate: String,
    pub item: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteRequest {
    pub targets: WriteTargets,
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteTargets {
    Items(Vec<Reference>),
    /// The result set of the read with this label.
    Read(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Fields(ChangePayload),
    Comment(String),
    Transition(String),
}
