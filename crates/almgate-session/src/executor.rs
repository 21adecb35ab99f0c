//! Dispatch executor.
//!
//! Runs a plan one step at a time against a [`ToolAdapter`]. Before every
//! step the rate-limit governor is consulted; before the first step the
//! ordering gate is re-run. Any failure stops the plan for good: steps are
//! never skipped, reordered, or retried, and a stopped execution cannot be
//! resumed. Run the plan again from scratch instead.

use crate::adapter::{
    AdapterFailure, DiscoveredEntity, ItemOutcome, ItemRecord, RelationGraph, ToolAdapter,
};
use crate::registry::{DiscoveryScope, RecordOutcome, Resolution};
use crate::session::Session;
use almgate_kernel::{
    Binding, CallArgs, CallId, Identifier, IdentifierKind, ItemSet, OrchestratorError, Plan,
    Provenance, Reference, RemoteId, ToolCall, ToolKind, ValidationFailure, check_order,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// What one successful step returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum StepOutput {
    Projects {
        projects: Vec<DiscoveredEntity>,
    },
    Trackers {
        project: RemoteId,
        trackers: Vec<DiscoveredEntity>,
    },
    Items {
        cbql: String,
        pages: u32,
        items: Vec<ItemRecord>,
    },
    Relations {
        graph: RelationGraph,
    },
    Writes {
        outcomes: Vec<ItemOutcome>,
    },
}

/// A completed step, tagged with the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub call_id: CallId,
    pub tool: ToolKind,
    pub completed_at: DateTime<Utc>,
    /// Identifiers this step added to the registry.
    pub recorded: usize,
    #[serde(flatten)]
    pub output: StepOutput,
}

impl StepResult {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            call_id: self.call_id,
            tool: self.tool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub session: Uuid,
    pub plan_digest: String,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OrchestratorError>,
    /// Steps left unexecuted because the run stopped.
    pub cancelled_steps: usize,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a step failed, and whether it reached the adapter.
enum StepError {
    /// Failed before anything was sent.
    Unsent(OrchestratorError),
    Dispatched(OrchestratorError),
}

/// An in-flight run of one plan within a session.
pub struct Execution<'a> {
    session: &'a mut Session,
    adapter: &'a dyn ToolAdapter,
    plan: Plan,
    cursor: usize,
    gate_checked: bool,
    stopped: bool,
    cancelled: usize,
    /// Item IDs returned by each query step.
    result_sets: BTreeMap<CallId, Vec<RemoteId>>,
    /// Project each discover-trackers step listed.
    tracker_scopes: BTreeMap<CallId, RemoteId>,
}

impl<'a> Execution<'a> {
    pub(crate) fn new(session: &'a mut Session, plan: Plan, adapter: &'a dyn ToolAdapter) -> Self {
        Self {
            session,
            adapter,
            plan,
            cursor: 0,
            gate_checked: false,
            stopped: false,
            cancelled: 0,
            result_sets: BTreeMap::new(),
            tracker_scopes: BTreeMap::new(),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Steps completed so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled
    }

    /// Run the next step.
    ///
    /// `Ok(None)` once the plan is finished or stopped. While the session is
    /// halted this keeps returning [`OrchestratorError::Halted`].
    pub async fn next_step(&mut self) -> Result<Option<StepResult>, OrchestratorError> {
        if self.stopped {
            self.session.governor.check()?;
            return Ok(None);
        }
        let Some(step) = self.plan.steps().get(self.cursor).cloned() else {
            return Ok(None);
        };

        if let Err(err) = self.session.governor.check() {
            self.stop(&err, 0);
            return Err(err);
        }
        if !self.gate_checked {
            if let Err(err) = check_order(self.plan.steps()) {
                self.stop(&err, 0);
                return Err(err);
            }
            self.gate_checked = true;
        }

        tracing::debug!(
            session = %self.session.id(),
            call_id = %step.call_id,
            tool = %step.kind(),
            "dispatching"
        );

        match self.dispatch(&step).await {
            Ok((output, recorded)) => {
                self.cursor += 1;
                tracing::info!(
                    session = %self.session.id(),
                    call_id = %step.call_id,
                    tool = %step.kind(),
                    recorded,
                    "step completed"
                );
                Ok(Some(StepResult {
                    call_id: step.call_id,
                    tool: step.kind(),
                    completed_at: Utc::now(),
                    recorded,
                    output,
                }))
            }
            Err(StepError::Unsent(err)) => {
                self.stop(&err, 0);
                Err(err)
            }
            Err(StepError::Dispatched(err)) => {
                self.stop(&err, 1);
                Err(err)
            }
        }
    }

    /// Drive the plan until it finishes or stops.
    pub async fn run_to_end(mut self) -> RunReport {
        let mut steps = Vec::new();
        let mut error = None;
        loop {
            match self.next_step().await {
                Ok(Some(result)) => steps.push(result),
                Ok(None) => break,
                Err(err) => {
                    error = Some(err);
                    break;
                }
            }
        }
        RunReport {
            session: self.session.id(),
            plan_digest: self.plan.digest(),
            steps,
            error,
            cancelled_steps: self.cancelled,
        }
    }

    /// Mark the run stopped. `in_flight` is 1 when the current step was
    /// dispatched and failed, 0 when it never left.
    fn stop(&mut self, err: &OrchestratorError, in_flight: usize) {
        self.stopped = true;
        self.cancelled = self
            .plan
            .len()
            .saturating_sub(self.cursor + in_flight);
        tracing::warn!(
            session = %self.session.id(),
            error = %err,
            cancelled = self.cancelled,
            "plan stopped"
        );
    }

    async fn dispatch(&mut self, step: &ToolCall) -> Result<(StepOutput, usize), StepError> {
        let adapter = self.adapter;
        let tool = step.kind();
        let provenance = Provenance {
            call_id: step.call_id,
            tool,
        };

        match &step.args {
            CallArgs::DiscoverProjects => {
                let projects = adapter
                    .discover_projects()
                    .await
                    .map_err(|f| StepError::Dispatched(self.failure(tool, f, None)))?;
                let mut recorded = 0;
                for project in &projects {
                    recorded += self.record(IdentifierKind::Project, project, None, provenance);
                }
                self.session
                    .registry
                    .note_discovery(DiscoveryScope::Projects);
                Ok((StepOutput::Projects { projects }, recorded))
            }
            CallArgs::DiscoverTrackers { project } => {
                let project = self.bind(project).map_err(StepError::Unsent)?.id();
                let trackers = adapter
                    .discover_trackers(project)
                    .await
                    .map_err(|f| StepError::Dispatched(self.failure(tool, f, None)))?;
                let mut recorded = 0;
                for tracker in &trackers {
                    recorded +=
                        self.record(IdentifierKind::Tracker, tracker, Some(project), provenance);
                }
                self.tracker_scopes.insert(step.call_id, project);
                self.session
                    .registry
                    .note_discovery(DiscoveryScope::TrackersOf(project));
                Ok((StepOutput::Trackers { project, trackers }, recorded))
            }
            CallArgs::Query { expression, .. } => {
                let bound = expression
                    .map_bindings(|b| self.bind(b).map(Binding::Known))
                    .map_err(StepError::Unsent)?;
                for literal in bound.identifier_literals() {
                    self.recorded(literal.kind, literal.id)
                        .map_err(StepError::Unsent)?;
                }
                let cbql = bound.render().map_err(|e| {
                    StepError::Unsent(OrchestratorError::ordering(step.call_id, e.to_string()))
                })?;
                let page_size = self.session.policy().query_page_size;
                let max_pages = self.session.policy().max_query_pages;

                let mut items = Vec::new();
                let mut page = 1;
                loop {
                    let batch = adapter
                        .query_page(&cbql, page, page_size)
                        .await
                        .map_err(|f| StepError::Dispatched(self.failure(tool, f, Some(&cbql))))?;
                    let short = batch.items.len() < page_size as usize;
                    items.extend(batch.items);
                    if short {
                        break;
                    }
                    if page >= max_pages {
                        return Err(StepError::Dispatched(OrchestratorError::Adapter {
                            tool,
                            message: format!(
                                "query still returned full pages after {max_pages} pages of {page_size}; result abandoned"
                            ),
                        }));
                    }
                    page += 1;
                }

                let mut recorded = 0;
                for item in &items {
                    let identifier = Identifier::observed(
                        IdentifierKind::Item,
                        item.id,
                        item.name.clone(),
                        item.tracker,
                        provenance,
                    );
                    if self.session.registry.record(identifier) == RecordOutcome::Inserted {
                        recorded += 1;
                    }
                }
                self.result_sets
                    .insert(step.call_id, items.iter().map(|i| i.id).collect());
                Ok((
                    StepOutput::Items {
                        cbql,
                        pages: page,
                        items,
                    },
                    recorded,
                ))
            }
            CallArgs::ExpandRelations { items } => {
                let ids = self
                    .items(step.call_id, items)
                    .map_err(StepError::Unsent)?;
                let graph = adapter
                    .expand_relations(&ids)
                    .await
                    .map_err(|f| StepError::Dispatched(self.failure(tool, f, None)))?;
                Ok((StepOutput::Relations { graph }, 0))
            }
            CallArgs::BulkUpdate { items, payload } => {
                let ids = self
                    .items(step.call_id, items)
                    .map_err(StepError::Unsent)?;
                let atomic = self.session.policy().atomic_bulk_updates;
                let outcomes = adapter
                    .bulk_update(&ids, payload, atomic)
                    .await
                    .map_err(|f| StepError::Dispatched(self.failure(tool, f, None)))?;
                Ok((StepOutput::Writes { outcomes }, 0))
            }
            CallArgs::SingleItemAction { item, action } => {
                let item = self.bind(item).map_err(StepError::Unsent)?.id();
                let outcome = adapter
                    .item_action(item, action)
                    .await
                    .map_err(|f| StepError::Dispatched(self.failure(tool, f, None)))?;
                Ok((
                    StepOutput::Writes {
                        outcomes: vec![outcome],
                    },
                    0,
                ))
            }
        }
    }

    /// Turn an adapter failure into the surfaced error, halting the session
    /// on a rate limit.
    fn failure(
        &mut self,
        tool: ToolKind,
        failure: AdapterFailure,
        cbql: Option<&str>,
    ) -> OrchestratorError {
        match failure {
            AdapterFailure::RateLimited { seconds } => {
                self.session.governor.halt(seconds);
                tracing::warn!(
                    session = %self.session.id(),
                    tool = %tool,
                    seconds,
                    "rate limited; session halted"
                );
                OrchestratorError::Halted {
                    seconds_remaining: seconds,
                }
            }
            AdapterFailure::InvalidQuery { message } if tool == ToolKind::Query => {
                OrchestratorError::Validation {
                    rejection: ValidationFailure::Remote { message },
                    expression: cbql.unwrap_or_default().to_string(),
                    corrected: false,
                }
            }
            other => OrchestratorError::Adapter {
                tool,
                message: other.to_string(),
            },
        }
    }

    fn record(
        &mut self,
        kind: IdentifierKind,
        entity: &DiscoveredEntity,
        parent: Option<RemoteId>,
        provenance: Provenance,
    ) -> usize {
        let identifier = Identifier::observed(
            kind,
            entity.id,
            Some(entity.name.clone()),
            entity.parent.or(parent),
            provenance,
        );
        match self.session.registry.record(identifier) {
            RecordOutcome::Inserted => 1,
            RecordOutcome::AlreadyKnown => 0,
        }
    }

    /// Resolve a binding against the registry as it stands now.
    fn bind(&self, binding: &Binding) -> Result<Identifier, OrchestratorError> {
        let (kind, reference, producer) = match binding {
            Binding::Known(claimed) => return self.vouched(claimed),
            Binding::Pending {
                kind,
                reference,
                producer,
            } => (*kind, reference, *producer),
        };

        let parent = match kind {
            IdentifierKind::Tracker => self.tracker_scopes.get(&producer).copied(),
            _ => None,
        };
        match self.session.registry.resolve_within(kind, reference, parent) {
            Resolution::Resolved(identifier) => Ok(identifier.clone()),
            Resolution::Unresolved => Err(OrchestratorError::unresolvable(
                kind,
                reference.clone(),
                format!("{producer} did not report it"),
            )),
            Resolution::Ambiguous(count) => Err(OrchestratorError::unresolvable(
                kind,
                reference.clone(),
                format!("{producer} reported {count} matches"),
            )),
        }
    }

    /// A known binding counts only if it is the registry's own entry, with
    /// the same provenance.
    fn vouched(&self, claimed: &Identifier) -> Result<Identifier, OrchestratorError> {
        let entry = self.recorded(claimed.kind(), claimed.id())?;
        if entry.provenance() != claimed.provenance() {
            return Err(OrchestratorError::unresolvable(
                claimed.kind(),
                Reference::Id(claimed.id()),
                format!(
                    "claimed provenance {} but the registry has {}",
                    claimed.provenance(),
                    entry.provenance()
                ),
            ));
        }
        Ok(entry.clone())
    }

    /// The registry entry for `id`, or unresolvable.
    fn recorded(&self, kind: IdentifierKind, id: RemoteId) -> Result<&Identifier, OrchestratorError> {
        self.session.registry.get(kind, id).ok_or_else(|| {
            OrchestratorError::unresolvable(
                kind,
                Reference::Id(id),
                "no earlier call in this session reported it",
            )
        })
    }

    fn items(&self, call_id: CallId, items: &ItemSet) -> Result<Vec<RemoteId>, OrchestratorError> {
        match items {
            ItemSet::Items(bindings) => bindings
                .iter()
                .map(|b| self.bind(b).map(|i| i.id()))
                .collect(),
            ItemSet::ResultOf(source) => self.result_sets.get(source).cloned().ok_or_else(|| {
                OrchestratorError::ordering(
                    call_id,
                    format!("result set of {source} is not available"),
                )
            }),
        }
    }
}
