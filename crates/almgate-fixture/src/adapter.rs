//! [`ToolAdapter`] over a [`FixtureWorkspace`].
//!
//! Writes mutate the in-memory workspace. Every call, faulted or not, lands
//! in the call log so tests can assert exactly what was dispatched.

use crate::eval::compile;
use crate::workspace::{Fault, FixtureWorkspace};
use almgate_kernel::{ChangePayload, ItemAction, RemoteId, ToolKind};
use almgate_session::{
    AdapterFailure, AdapterResult, DiscoveredEntity, ItemOutcome, ItemRecord, QueryPage,
    RelationDirection, RelationEdge, RelationGraph, ToolAdapter,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// One call the adapter received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub tool: ToolKind,
    pub detail: String,
    /// The scripted response returned instead, if a fault fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

#[derive(Debug)]
struct State {
    workspace: FixtureWorkspace,
    faults: Vec<Fault>,
    served: BTreeMap<ToolKind, usize>,
    log: Vec<CallRecord>,
}

#[derive(Debug)]
pub struct FixtureAdapter {
    state: Mutex<State>,
}

impl FixtureAdapter {
    pub fn new(mut workspace: FixtureWorkspace) -> Self {
        let faults = std::mem::take(&mut workspace.faults);
        Self {
            state: Mutex::new(State {
                workspace,
                faults,
                served: BTreeMap::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Script an extra fault.
    pub async fn push_fault(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    /// Drop every scripted fault that has not fired yet.
    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().await.log.clone()
    }

    pub async fn calls_to(&self, tool: ToolKind) -> usize {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|c| c.tool == tool)
            .count()
    }

    /// Snapshot of the workspace, including applied writes.
    pub async fn workspace(&self) -> FixtureWorkspace {
        self.state.lock().await.workspace.clone()
    }
}

impl State {
    /// Log the call and fire a matching fault, if any.
    fn enter(&mut self, tool: ToolKind, detail: String) -> AdapterResult<()> {
        let served = self.served.entry(tool).or_default();
        let position = self
            .faults
            .iter()
            .position(|f| f.tool == tool && *served >= f.after_calls);
        *served += 1;

        let Some(index) = position else {
            self.log.push(CallRecord {
                tool,
                detail,
                fault: None,
            });
            return Ok(());
        };

        let response = if self.faults[index].sticky {
            self.faults[index].response.clone()
        } else {
            self.faults.remove(index).response
        };
        tracing::debug!(tool = %tool, response = %response, "fixture fault fired");
        self.log.push(CallRecord {
            tool,
            detail,
            fault: Some(response.clone()),
        });
        Err(AdapterFailure::from_message(&response))
    }

    fn apply(&mut self, item: RemoteId, action: &ItemAction) -> ItemOutcome {
        let Some(target) = self.workspace.item_mut(item) else {
            return ItemOutcome::failed(item, format!("item {item} not found"));
        };
        match action {
            ItemAction::Update { payload } => {
                for (field, value) in payload.fields() {
                    target.fields.insert(field.clone(), value.clone());
                }
            }
            ItemAction::Comment { text } => target.comments.push(text.clone()),
            ItemAction::Transition { to } => {
                target
                    .fields
                    .insert("status".to_string(), serde_json::Value::String(to.clone()));
            }
        }
        ItemOutcome::ok(item)
    }
}

fn id_list(ids: &[RemoteId]) -> String {
    ids.iter()
        .map(RemoteId::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ToolAdapter for FixtureAdapter {
    async fn discover_projects(&self) -> AdapterResult<Vec<DiscoveredEntity>> {
        let mut state = self.state.lock().await;
        state.enter(ToolKind::DiscoverProjects, String::new())?;
        Ok(state
            .workspace
            .projects
            .iter()
            .map(|p| DiscoveredEntity {
                id: p.id,
                name: p.name.clone(),
                parent: None,
            })
            .collect())
    }

    async fn discover_trackers(&self, project: RemoteId) -> AdapterResult<Vec<DiscoveredEntity>> {
        let mut state = self.state.lock().await;
        state.enter(ToolKind::DiscoverTrackers, format!("project={project}"))?;
        let Some(found) = state.workspace.project(project) else {
            return Err(AdapterFailure::Remote {
                message: format!("404 project {project} not found"),
            });
        };
        Ok(found
            .trackers
            .iter()
            .map(|t| DiscoveredEntity {
                id: t.id,
                name: t.name.clone(),
                parent: Some(project),
            })
            .collect())
    }

    async fn query_page(&self, cbql: &str, page: u32, page_size: u32) -> AdapterResult<QueryPage> {
        let mut state = self.state.lock().await;
        state.enter(ToolKind::Query, format!("page={page} {cbql}"))?;
        let filter = compile(cbql).map_err(|e| AdapterFailure::InvalidQuery {
            message: e.to_string(),
        })?;

        let skip = (page.saturating_sub(1) as usize) * page_size as usize;
        let workspace = &state.workspace;
        let items = workspace
            .items
            .iter()
            .filter(|item| filter.matches(item, workspace))
            .skip(skip)
            .take(page_size as usize)
            .map(|item| ItemRecord {
                id: item.id,
                name: Some(item.name.clone()),
                tracker: Some(item.tracker),
                fields: item.fields.clone(),
            })
            .collect();
        Ok(QueryPage { items })
    }

    async fn expand_relations(&self, items: &[RemoteId]) -> AdapterResult<RelationGraph> {
        let mut state = self.state.lock().await;
        state.enter(ToolKind::ExpandRelations, id_list(items))?;

        let mut edges = Vec::new();
        for id in items {
            for other in &state.workspace.items {
                if other.id == *id {
                    for link in &other.links {
                        edges.push(RelationEdge {
                            from: *id,
                            to: *link,
                            direction: RelationDirection::Downstream,
                            relation: "hasLinkTo".to_string(),
                        });
                    }
                    if let Some(parent) = other.parent {
                        edges.push(RelationEdge {
                            from: *id,
                            to: parent,
                            direction: RelationDirection::Upstream,
                            relation: "hasParent".to_string(),
                        });
                    }
                    continue;
                }
                if other.links.contains(id) {
                    edges.push(RelationEdge {
                        from: *id,
                        to: other.id,
                        direction: RelationDirection::Upstream,
                        relation: "hasLinkTo".to_string(),
                    });
                }
                if other.parent == Some(*id) {
                    edges.push(RelationEdge {
                        from: *id,
                        to: other.id,
                        direction: RelationDirection::Downstream,
                        relation: "hasChild".to_string(),
                    });
                }
            }
        }
        edges.sort();
        edges.dedup();
        Ok(RelationGraph { edges })
    }

    async fn bulk_update(
        &self,
        items: &[RemoteId],
        payload: &ChangePayload,
        atomic: bool,
    ) -> AdapterResult<Vec<ItemOutcome>> {
        let mut state = self.state.lock().await;
        state.enter(
            ToolKind::BulkUpdate,
            format!("items={} {}", id_list(items), payload.canonical()),
        )?;

        if atomic {
            let missing = items
                .iter()
                .find(|id| state.workspace.item(**id).is_none())
                .copied();
            if let Some(missing) = missing {
                return Ok(items
                    .iter()
                    .map(|id| {
                        ItemOutcome::failed(
                            *id,
                            format!("atomic batch aborted: item {missing} not found"),
                        )
                    })
                    .collect());
            }
        }

        let action = ItemAction::Update {
            payload: payload.clone(),
        };
        Ok(items.iter().map(|id| state.apply(*id, &action)).collect())
    }

    async fn item_action(&self, item: RemoteId, action: &ItemAction) -> AdapterResult<ItemOutcome> {
        let mut state = self.state.lock().await;
        state.enter(ToolKind::SingleItemAction, format!("item={item}"))?;
        Ok(state.apply(item, action))
    }
}
