//! Tool calls: one invocation of one fixed tool kind with bound arguments.

use crate::cbql::QueryExpression;
use crate::identifier::{Binding, CallId, IdentifierKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    DiscoverProjects,
    DiscoverTrackers,
    Query,
    ExpandRelations,
    BulkUpdate,
    SingleItemAction,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        Self::DiscoverProjects,
        Self::DiscoverTrackers,
        Self::Query,
        Self::ExpandRelations,
        Self::BulkUpdate,
        Self::SingleItemAction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscoverProjects => "discover-projects",
            Self::DiscoverTrackers => "discover-trackers",
            Self::Query => "query",
            Self::ExpandRelations => "expand-relations",
            Self::BulkUpdate => "bulk-update",
            Self::SingleItemAction => "single-item-action",
        }
    }

    pub fn phase(self) -> Phase {
        match self {
            Self::DiscoverProjects | Self::DiscoverTrackers => Phase::Discovery,
            Self::Query => Phase::Query,
            Self::ExpandRelations => Phase::Expansion,
            Self::BulkUpdate | Self::SingleItemAction => Phase::Write,
        }
    }

    /// Kind of identifier this tool reports, if its results feed the registry.
    pub fn yields(self) -> Option<IdentifierKind> {
        match self {
            Self::DiscoverProjects => Some(IdentifierKind::Project),
            Self::DiscoverTrackers => Some(IdentifierKind::Tracker),
            Self::Query => Some(IdentifierKind::Item),
            Self::ExpandRelations | Self::BulkUpdate | Self::SingleItemAction => None,
        }
    }

    pub fn is_write(self) -> bool {
        self.phase() == Phase::Write
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan phases, in the only order a plan may visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Query,
    Expansion,
    Write,
}

/// Field changes applied to an item.
///
/// Two payloads are mergeable exactly when their canonical JSON is equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangePayload {
    fields: BTreeMap<String, Value>,
}

impl ChangePayload {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical form used to group identical payloads.
    pub fn canonical(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

/// An explicit action on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ItemAction {
    Update { payload: ChangePayload },
    Comment { text: String },
    /// Move the item through its workflow to the named status.
    Transition { to: String },
}

/// The items a call operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSet {
    /// Explicit, already-resolved items.
    Items(Vec<Binding>),
    /// Whatever the named query step returns.
    ResultOf(CallId),
}

impl ItemSet {
    fn renumbered(&self, map: &impl Fn(CallId) -> CallId) -> Self {
        match self {
            Self::ResultOf(call_id) => Self::ResultOf(map(*call_id)),
            Self::Items(items) => Self::Items(items.iter().map(|b| b.renumbered(map)).collect()),
        }
    }

    pub fn source(&self) -> Option<CallId> {
        match self {
            Self::ResultOf(call_id) => Some(*call_id),
            Self::Items(_) => None,
        }
    }

    fn preview(&self) -> String {
        match self {
            Self::ResultOf(call_id) => format!("results of {call_id}"),
            Self::Items(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(Binding::preview)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tool", rename_all = "kebab-case")]
pub enum CallArgs {
    DiscoverProjects,
    DiscoverTrackers {
        project: Binding,
    },
    Query {
        expression: QueryExpression,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    ExpandRelations {
        items: ItemSet,
    },
    BulkUpdate {
        items: ItemSet,
        payload: ChangePayload,
    },
    SingleItemAction {
        item: Binding,
        action: ItemAction,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub call_id: CallId,
    #[serde(flatten)]
    pub args: CallArgs,
}

impl ToolCall {
    pub fn new(call_id: CallId, args: CallArgs) -> Self {
        Self { call_id, args }
    }

    pub fn kind(&self) -> ToolKind {
        match &self.args {
            CallArgs::DiscoverProjects => ToolKind::DiscoverProjects,
            CallArgs::DiscoverTrackers { .. } => ToolKind::DiscoverTrackers,
            CallArgs::Query { .. } => ToolKind::Query,
            CallArgs::ExpandRelations { .. } => ToolKind::ExpandRelations,
            CallArgs::BulkUpdate { .. } => ToolKind::BulkUpdate,
            CallArgs::SingleItemAction { .. } => ToolKind::SingleItemAction,
        }
    }

    /// Every identifier slot this call consumes.
    pub fn bindings(&self) -> Vec<&Binding> {
        match &self.args {
            CallArgs::DiscoverProjects => Vec::new(),
            CallArgs::DiscoverTrackers { project } => vec![project],
            CallArgs::Query { expression, .. } => expression.bindings().collect(),
            CallArgs::ExpandRelations { items } | CallArgs::BulkUpdate { items, .. } => {
                match items {
                    ItemSet::Items(items) => items.iter().collect(),
                    ItemSet::ResultOf(_) => Vec::new(),
                }
            }
            CallArgs::SingleItemAction { item, .. } => vec![item],
        }
    }

    /// The step whose result set this call consumes.
    pub fn item_source(&self) -> Option<CallId> {
        match &self.args {
            CallArgs::ExpandRelations { items } | CallArgs::BulkUpdate { items, .. } => {
                items.source()
            }
            _ => None,
        }
    }

    /// Copy with this call's ID and every call ID it refers to passed
    /// through `map`. Known identifiers keep their provenance.
    pub fn renumbered(&self, map: impl Fn(CallId) -> CallId) -> Self {
        let args = match &self.args {
            CallArgs::DiscoverProjects => CallArgs::DiscoverProjects,
            CallArgs::DiscoverTrackers { project } => CallArgs::DiscoverTrackers {
                project: project.renumbered(&map),
            },
            CallArgs::Query { expression, label } => CallArgs::Query {
                expression: expression
                    .map_bindings(|b| Ok::<_, std::convert::Infallible>(b.renumbered(&map)))
                    .unwrap_or_else(|never| match never {}),
                label: label.clone(),
            },
            CallArgs::ExpandRelations { items } => CallArgs::ExpandRelations {
                items: items.renumbered(&map),
            },
            CallArgs::BulkUpdate { items, payload } => CallArgs::BulkUpdate {
                items: items.renumbered(&map),
                payload: payload.clone(),
            },
            CallArgs::SingleItemAction { item, action } => CallArgs::SingleItemAction {
                item: item.renumbered(&map),
                action: action.clone(),
            },
        };
        Self {
            call_id: map(self.call_id),
            args,
        }
    }

    /// One-line description for plan listings.
    pub fn summary(&self) -> String {
        match &self.args {
            CallArgs::DiscoverProjects => "discover-projects".to_string(),
            CallArgs::DiscoverTrackers { project } => {
                format!("discover-trackers project={}", project.preview())
            }
            CallArgs::Query { expression, label } => match label {
                Some(label) => format!("query[{label}] {}", expression.preview()),
                None => format!("query {}", expression.preview()),
            },
            CallArgs::ExpandRelations { items } => {
                format!("expand-relations {}", items.preview())
            }
            CallArgs::BulkUpdate { items, payload } => {
                format!("bulk-update {} {}", items.preview(), payload.canonical())
            }
            CallArgs::SingleItemAction { item, action } => {
                let action = match action {
                    ItemAction::Update { payload } => format!("update {}", payload.canonical()),
                    ItemAction::Comment { text } => format!("comment {text:?}"),
                    ItemAction::Transition { to } => format!("transition to {to:?}"),
                };
                format!("single-item-action item={} {action}", item.preview())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_canonical_form_is_key_ordered() {
        let a = ChangePayload::default().with("status", "Done").with("owner", "kim");
        let b = ChangePayload::default().with("owner", "kim").with("status", "Done");
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), r#"{"owner":"kim","status":"Done"}"#);
    }

    #[test]
    fn phases_are_ordered() {
        assert!(ToolKind::DiscoverTrackers.phase() < ToolKind::Query.phase());
        assert!(ToolKind::Query.phase() < ToolKind::ExpandRelations.phase());
        assert!(ToolKind::ExpandRelations.phase() < ToolKind::BulkUpdate.phase());
        assert_eq!(ToolKind::SingleItemAction.phase(), Phase::Write);
    }

    #[test]
    fn tool_call_serializes_with_tool_tag() {
        let call = ToolCall::new(
            CallId::new(4),
            CallArgs::BulkUpdate {
                items: ItemSet::ResultOf(CallId::new(2)),
                payload: ChangePayload::default().with("status", "Done"),
            },
        );
        assert_eq!(
            serde_json::to_value(&call).expect("serializable"),
            json!({
                "callId": 4,
                "tool": "bulk-update",
                "items": {"result_of": 2},
                "payload": {"status": "Done"}
            })
        );
        assert_eq!(call.item_source(), Some(CallId::new(2)));
        assert_eq!(
            call.summary(),
            r#"bulk-update results of call-2 {"status":"Done"}"#
        );
    }

    #[test]
    fn renumbering_rewrites_every_call_reference() {
        let call = ToolCall::new(
            CallId::new(7),
            CallArgs::ExpandRelations {
                items: ItemSet::ResultOf(CallId::new(5)),
            },
        );
        let moved = call.renumbered(|id| CallId::new(id.get() + 100));
        assert_eq!(moved.call_id, CallId::new(107));
        assert_eq!(moved.item_source(), Some(CallId::new(105)));
    }

    #[test]
    fn tool_kind_names_are_kebab_case() {
        let names: Vec<&str> = ToolKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "discover-projects",
                "discover-trackers",
                "query",
                "expand-relations",
                "bulk-update",
                "single-item-action"
            ]
        );
    }
}
