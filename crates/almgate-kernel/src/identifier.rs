//! Identifiers and their provenance.
//!
//! An [`Identifier`] is only ever built from adapter output: it carries the
//! [`Provenance`] of the call that produced it. Anything an intent names is a
//! [`Reference`] until the registry resolves it.

use crate::call::ToolKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a remote handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Project,
    Tracker,
    Item,
}

impl IdentifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Tracker => "tracker",
            Self::Item => "item",
        }
    }

    /// The discovery tool that is the source of truth for this kind.
    ///
    /// Items have none: they only ever come back from queries.
    pub fn discovered_by(self) -> Option<ToolKind> {
        match self {
            Self::Project => Some(ToolKind::DiscoverProjects),
            Self::Tracker => Some(ToolKind::DiscoverTrackers),
            Self::Item => None,
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque remote handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(u64);

impl RemoteId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-unique ID of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Which call produced an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub call_id: CallId,
    pub tool: ToolKind,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.call_id, self.tool)
    }
}

/// A remote handle observed in a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    kind: IdentifierKind,
    id: RemoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    /// Owning project of a tracker, owning tracker of an item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<RemoteId>,
    provenance: Provenance,
}

impl Identifier {
    /// Build an identifier from an adapter result.
    ///
    /// Callers outside the dispatch path should go through the registry
    /// instead; an identifier without a real producing call is a fabrication.
    pub fn observed(
        kind: IdentifierKind,
        id: RemoteId,
        name: Option<String>,
        parent: Option<RemoteId>,
        provenance: Provenance,
    ) -> Self {
        Self {
            kind,
            id,
            name,
            parent,
            provenance,
        }
    }

    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn id(&self) -> RemoteId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parent(&self) -> Option<RemoteId> {
        self.parent
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Whether `reference` names this identifier.
    ///
    /// Name matching is exact after trimming; no fuzzy or case-folded
    /// matching, so a near-miss stays unresolved.
    pub fn matches(&self, reference: &Reference) -> bool {
        match reference {
            Reference::Id(id) => self.id == *id,
            Reference::Name(name) => self.name.as_deref() == Some(name.trim()),
        }
    }
}

/// How an intent names a project, tracker, or item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    Id(RemoteId),
    Name(String),
}

impl Reference {
    pub fn id(raw: u64) -> Self {
        Self::Id(RemoteId::new(raw))
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// An identifier slot inside a tool call.
///
/// `Pending` slots are filled at dispatch time from the registry, after the
/// discovery call named by `producer` has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "binding", rename_all = "snake_case")]
pub enum Binding {
    Known(Identifier),
    Pending {
        kind: IdentifierKind,
        reference: Reference,
        producer: CallId,
    },
}

impl Binding {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            Self::Known(identifier) => identifier.kind(),
            Self::Pending { kind, .. } => *kind,
        }
    }

    pub fn known(&self) -> Option<&Identifier> {
        match self {
            Self::Known(identifier) => Some(identifier),
            Self::Pending { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Copy with the producer call ID passed through `map`.
    pub fn renumbered(&self, map: impl Fn(CallId) -> CallId) -> Self {
        match self {
            Self::Known(identifier) => Self::Known(identifier.clone()),
            Self::Pending {
                kind,
                reference,
                producer,
            } => Self::Pending {
                kind: *kind,
                reference: reference.clone(),
                producer: map(*producer),
            },
        }
    }

    /// Human-readable form used in plan previews.
    pub fn preview(&self) -> String {
        match self {
            Self::Known(identifier) => identifier.id().to_string(),
            Self::Pending {
                kind,
                reference,
                producer,
            } => format!("<{kind} {reference} via {producer}>"),
        }
    }
}
