//! Identifier registry: the only legitimate source of identifiers.
//!
//! Append-only for the lifetime of a session. Entries arrive exclusively from
//! successful discovery/query results during dispatch; the planner only reads.

use almgate_kernel::{Identifier, IdentifierKind, Reference, RemoteId};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of a lookup. Never a guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    Resolved(&'a Identifier),
    Unresolved,
    /// More than one identifier matches the reference.
    Ambiguous(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// Already sighted; the first sighting's provenance is kept.
    AlreadyKnown,
}

/// A discovery listing that has completed at least once this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoveryScope {
    Projects,
    TrackersOf(RemoteId),
}

#[derive(Debug, Clone, Default)]
pub struct IdentifierRegistry {
    entries: BTreeMap<(IdentifierKind, RemoteId), Identifier>,
    completed: BTreeSet<DiscoveryScope>,
}

impl IdentifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, identifier: Identifier) -> RecordOutcome {
        let key = (identifier.kind(), identifier.id());
        if self.entries.contains_key(&key) {
            return RecordOutcome::AlreadyKnown;
        }
        self.entries.insert(key, identifier);
        RecordOutcome::Inserted
    }

    /// Remember that a full listing for `scope` has been recorded. Anything
    /// it did not report will not appear by discovering again.
    pub fn note_discovery(&mut self, scope: DiscoveryScope) {
        self.completed.insert(scope);
    }

    pub fn has_discovered(&self, scope: DiscoveryScope) -> bool {
        self.completed.contains(&scope)
    }

    pub fn resolve(&self, kind: IdentifierKind, reference: &Reference) -> Resolution<'_> {
        self.resolve_within(kind, reference, None)
    }

    /// Resolve, optionally restricted to identifiers owned by `parent`.
    pub fn resolve_within(
        &self,
        kind: IdentifierKind,
        reference: &Reference,
        parent: Option<RemoteId>,
    ) -> Resolution<'_> {
        let in_parent = |identifier: &&Identifier| match parent {
            Some(parent) => identifier.parent() == Some(parent),
            None => true,
        };

        if let Reference::Id(id) = reference {
            return match self.entries.get(&(kind, *id)).filter(in_parent) {
                Some(identifier) => Resolution::Resolved(identifier),
                None => Resolution::Unresolved,
            };
        }

        let matches: Vec<&Identifier> = self
            .entries
            .range((kind, RemoteId::new(0))..=(kind, RemoteId::new(u64::MAX)))
            .map(|(_, identifier)| identifier)
            .filter(in_parent)
            .filter(|identifier| identifier.matches(reference))
            .collect();

        match matches.as_slice() {
            [] => Resolution::Unresolved,
            [only] => Resolution::Resolved(only),
            many => Resolution::Ambiguous(many.len()),
        }
    }

    pub fn get(&self, kind: IdentifierKind, id: RemoteId) -> Option<&Identifier> {
        self.entries.get(&(kind, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: IdentifierKind) -> usize {
        self.entries.keys().filter(|(k, _)| *k == kind).count()
    }

    /// All identifiers in deterministic (kind, id) order.
    pub fn iter(&self) -> impl Iterator<Item = &Identifier> {
        self.entries.values()
    }
}
