//! Fixture workspace: projects, trackers, items, and scripted faults.

use almgate_kernel::{RemoteId, ToolKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse fixture: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid fixture: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FixtureWorkspace {
    pub projects: Vec<FixtureProject>,
    pub items: Vec<FixtureItem>,
    pub faults: Vec<Fault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureProject {
    pub id: RemoteId,
    pub name: String,
    #[serde(default)]
    pub trackers: Vec<FixtureTracker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureTracker {
    pub id: RemoteId,
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureItem {
    pub id: RemoteId,
    pub tracker: RemoteId,
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Outgoing `hasLinkTo` links.
    #[serde(default)]
    pub links: Vec<RemoteId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RemoteId>,
    #[serde(default)]
    pub comments: Vec<String>,
}

/// A canned failure: the `after_calls + 1`-th call to `tool` returns
/// `response` instead of touching the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fault {
    pub tool: ToolKind,
    #[serde(default)]
    pub after_calls: usize,
    /// Raw error text, e.g. `RATE_LIMITED:30` or `INVALID_CBQL: bad field`.
    pub response: String,
    /// Fire on every matching call from then on, not just once.
    #[serde(default)]
    pub sticky: bool,
}

impl FixtureWorkspace {
    pub fn from_json_str(raw: &str) -> Result<Self, FixtureError> {
        let workspace: Self = serde_json::from_str(raw)?;
        workspace.validate()?;
        Ok(workspace)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FixtureError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FixtureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject duplicate IDs and dangling tracker/link/parent references.
    pub fn validate(&self) -> Result<(), FixtureError> {
        let mut projects = BTreeSet::new();
        let mut trackers = BTreeSet::new();
        for project in &self.projects {
            if !projects.insert(project.id) {
                return Err(FixtureError::Invalid(format!(
                    "duplicate project id {}",
                    project.id
                )));
            }
            for tracker in &project.trackers {
                if !trackers.insert(tracker.id) {
                    return Err(FixtureError::Invalid(format!(
                        "duplicate tracker id {}",
                        tracker.id
                    )));
                }
            }
        }

        let mut items = BTreeSet::new();
        for item in &self.items {
            if !items.insert(item.id) {
                return Err(FixtureError::Invalid(format!("duplicate item id {}", item.id)));
            }
            if !trackers.contains(&item.tracker) {
                return Err(FixtureError::Invalid(format!(
                    "item {} names unknown tracker {}",
                    item.id, item.tracker
                )));
            }
        }
        for item in &self.items {
            let dangling = item
                .links
                .iter()
                .chain(item.parent.iter())
                .find(|target| !items.contains(*target));
            if let Some(target) = dangling {
                return Err(FixtureError::Invalid(format!(
                    "item {} refers to unknown item {target}",
                    item.id
                )));
            }
        }
        Ok(())
    }

    pub fn project(&self, id: RemoteId) -> Option<&FixtureProject> {
        self.projects.iter().find(|p| p.id == id)
    }

    /// A tracker and the project that owns it.
    pub fn tracker(&self, id: RemoteId) -> Option<(&FixtureProject, &FixtureTracker)> {
        self.projects.iter().find_map(|project| {
            project
                .trackers
                .iter()
                .find(|t| t.id == id)
                .map(|tracker| (project, tracker))
        })
    }

    pub fn item(&self, id: RemoteId) -> Option<&FixtureItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn item_mut(&mut self, id: RemoteId) -> Option<&mut FixtureItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_item_in_unknown_tracker() {
        let err = FixtureWorkspace::from_json_str(
            r#"{"items": [{"id": 1, "tracker": 9, "name": "orphan"}]}"#,
        )
        .expect_err("tracker 9 does not exist");
        assert!(err.to_string().contains("unknown tracker 9"));
    }

    #[test]
    fn rejects_dangling_link() {
        let err = FixtureWorkspace::from_json_str(
            r#"{
                "projects": [{"id": 1, "name": "P", "trackers": [{"id": 2, "name": "T"}]}],
                "items": [{"id": 10, "tracker": 2, "name": "a", "links": [11]}]
            }"#,
        )
        .expect_err("item 11 does not exist");
        assert!(matches!(err, FixtureError::Invalid(_)));
    }

    #[test]
    fn parses_faults_with_kebab_case_tools() {
        let workspace = FixtureWorkspace::from_json_str(
            r#"{"faults": [{"tool": "discover-trackers", "response": "RATE_LIMITED:30"}]}"#,
        )
        .expect("valid fixture");
        assert_eq!(workspace.faults[0].tool, ToolKind::DiscoverTrackers);
        assert_eq!(workspace.faults[0].after_calls, 0);
        assert!(!workspace.faults[0].sticky);
    }
}
