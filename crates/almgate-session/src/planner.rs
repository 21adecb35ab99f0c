//! Call planner: intent in, gate-checked plan out.
//!
//! The planner reads the registry but never writes it. Anything the registry
//! cannot resolve yet becomes a `Pending` binding on a discovery step the
//! planner schedules; anything that discovery already failed to report, or
//! that has no discovery tool at all (items), is an unresolvable reference.
//!
//! Steps are built with provisional call IDs, then renumbered so IDs follow
//! plan order: discovery, queries, expansions, writes.

use crate::intent::{Change, Intent, ReadRequest, WriteRequest, WriteTargets};
use crate::registry::{DiscoveryScope, IdentifierRegistry, Resolution};
use almgate_kernel::cbql::Token;
use almgate_kernel::{
    BULK_MIN_TARGETS, Binding, CallArgs, CallId, ChangePayload, IdentifierKind, ItemAction, ItemSet,
    OrchestratorError, Plan, PolicyConfig, QueryExpression, Reference, ScopeHint, ScopeKind,
    ToolCall, ValidationFailure, correct, validate,
};
use std::collections::BTreeMap;

/// Build a plan for `intent`. Call IDs start at `first`.
pub fn plan_intent(
    intent: &Intent,
    policy: &PolicyConfig,
    registry: &IdentifierRegistry,
    first: CallId,
) -> Result<Plan, OrchestratorError> {
    if intent.is_empty() {
        return Err(OrchestratorError::invalid_intent(
            "intent has no reads and no writes",
        ));
    }

    let mut planner = Planner::new(policy, registry);
    let project = match &intent.project {
        Some(reference) => Some(planner.project(reference)?),
        None => None,
    };

    for read in &intent.reads {
        planner.plan_read(read, project.as_ref())?;
    }
    planner.plan_writes(&intent.writes)?;

    let steps = planner.finish(first);
    tracing::debug!(steps = steps.len(), first = %first, "planned intent");
    Plan::new(steps)
}

struct Planner<'a> {
    policy: &'a PolicyConfig,
    registry: &'a IdentifierRegistry,
    next: u64,
    discover_projects: Option<ToolCall>,
    discover_trackers: Vec<ToolCall>,
    queries: Vec<ToolCall>,
    expansions: Vec<ToolCall>,
    writes: Vec<ToolCall>,
    labels: BTreeMap<String, CallId>,
}

impl<'a> Planner<'a> {
    fn new(policy: &'a PolicyConfig, registry: &'a IdentifierRegistry) -> Self {
        Self {
            policy,
            registry,
            next: 0,
            discover_projects: None,
            discover_trackers: Vec::new(),
            queries: Vec::new(),
            expansions: Vec::new(),
            writes: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    fn provisional(&mut self) -> CallId {
        self.next += 1;
        CallId::new(self.next)
    }

    /// Renumber in plan order starting at `first`.
    fn finish(self, first: CallId) -> Vec<ToolCall> {
        let ordered: Vec<ToolCall> = self
            .discover_projects
            .into_iter()
            .chain(self.discover_trackers)
            .chain(self.queries)
            .chain(self.expansions)
            .chain(self.writes)
            .collect();
        let positions: BTreeMap<CallId, CallId> = ordered
            .iter()
            .enumerate()
            .map(|(i, step)| (step.call_id, CallId::new(first.get() + i as u64)))
            .collect();
        ordered
            .iter()
            .map(|step| step.renumbered(|id| positions.get(&id).copied().unwrap_or(id)))
            .collect()
    }

    fn discover_projects_call(&mut self) -> CallId {
        if let Some(step) = &self.discover_projects {
            return step.call_id;
        }
        let call_id = self.provisional();
        self.discover_projects = Some(ToolCall::new(call_id, CallArgs::DiscoverProjects));
        call_id
    }

    /// One discover-trackers step per project.
    fn discover_trackers_call(&mut self, project: &Binding) -> CallId {
        let existing = self.discover_trackers.iter().find(|step| {
            matches!(&step.args, CallArgs::DiscoverTrackers { project: p } if p == project)
        });
        if let Some(step) = existing {
            return step.call_id;
        }
        let call_id = self.provisional();
        self.discover_trackers.push(ToolCall::new(
            call_id,
            CallArgs::DiscoverTrackers {
                project: project.clone(),
            },
        ));
        call_id
    }

    fn project(&mut self, reference: &Reference) -> Result<Binding, OrchestratorError> {
        match self.registry.resolve(IdentifierKind::Project, reference) {
            Resolution::Resolved(identifier) => Ok(Binding::Known(identifier.clone())),
            Resolution::Ambiguous(count) => Err(ambiguous(IdentifierKind::Project, reference, count)),
            Resolution::Unresolved if self.registry.has_discovered(DiscoveryScope::Projects) => {
                Err(OrchestratorError::unresolvable(
                    IdentifierKind::Project,
                    reference.clone(),
                    "not among the projects discovery reported",
                ))
            }
            Resolution::Unresolved => Ok(Binding::Pending {
                kind: IdentifierKind::Project,
                reference: reference.clone(),
                producer: self.discover_projects_call(),
            }),
        }
    }

    fn tracker(
        &mut self,
        reference: &Reference,
        project: Option<&Binding>,
    ) -> Result<Binding, OrchestratorError> {
        let resolution = match project {
            Some(Binding::Known(p)) => {
                self.registry
                    .resolve_within(IdentifierKind::Tracker, reference, Some(p.id()))
            }
            Some(Binding::Pending { .. }) => Resolution::Unresolved,
            None => self.registry.resolve(IdentifierKind::Tracker, reference),
        };

        match resolution {
            Resolution::Resolved(identifier) => Ok(Binding::Known(identifier.clone())),
            Resolution::Ambiguous(count) => Err(ambiguous(IdentifierKind::Tracker, reference, count)),
            Resolution::Unresolved => {
                let Some(project) = project else {
                    return Err(OrchestratorError::unresolvable(
                        IdentifierKind::Tracker,
                        reference.clone(),
                        "no project in scope to discover trackers in",
                    ));
                };
                if let Binding::Known(p) = project {
                    if self
                        .registry
                        .has_discovered(DiscoveryScope::TrackersOf(p.id()))
                    {
                        return Err(OrchestratorError::unresolvable(
                            IdentifierKind::Tracker,
                            reference.clone(),
                            format!("not among the trackers discovered in project {}", p.id()),
                        ));
                    }
                }
                Ok(Binding::Pending {
                    kind: IdentifierKind::Tracker,
                    reference: reference.clone(),
                    producer: self.discover_trackers_call(project),
                })
            }
        }
    }

    /// Items have no discovery tool: only earlier query results count.
    fn item(&self, reference: &Reference) -> Result<Binding, OrchestratorError> {
        match self.registry.resolve(IdentifierKind::Item, reference) {
            Resolution::Resolved(identifier) => Ok(Binding::Known(identifier.clone())),
            Resolution::Ambiguous(count) => Err(ambiguous(IdentifierKind::Item, reference, count)),
            Resolution::Unresolved => Err(OrchestratorError::unresolvable(
                IdentifierKind::Item,
                reference.clone(),
                "items are only known from earlier query results",
            )),
        }
    }

    fn plan_read(
        &mut self,
        read: &ReadRequest,
        project: Option<&Binding>,
    ) -> Result<(), OrchestratorError> {
        let mut expression = QueryExpression::parse(&read.cbql);
        for relation in &read.relations {
            let argument = match &relation.item {
                Reference::Id(id) => Token::Number(id.to_string()),
                name => Token::Ident(self.item(name)?),
            };
            expression = expression.and(vec![
                Token::word(relation.predicate.as_str()),
                Token::LParen,
                argument,
                Token::RParen,
            ]);
        }

        let expression = self.validated(expression, read, project)?;
        let expression = self.bind_literals(expression, project)?;

        let call_id = self.provisional();
        if let Some(label) = &read.label {
            if self.labels.insert(label.clone(), call_id).is_some() {
                return Err(OrchestratorError::invalid_intent(format!(
                    "read label `{label}` is used more than once"
                )));
            }
        }
        self.queries.push(ToolCall::new(
            call_id,
            CallArgs::Query {
                expression,
                label: read.label.clone(),
            },
        ));

        if read.expand_relations {
            let expansion = self.provisional();
            self.expansions.push(ToolCall::new(
                expansion,
                CallArgs::ExpandRelations {
                    items: ItemSet::ResultOf(call_id),
                },
            ));
        }
        Ok(())
    }

    /// Validate, apply at most one correction pass, validate once more.
    fn validated(
        &mut self,
        expression: QueryExpression,
        read: &ReadRequest,
        project: Option<&Binding>,
    ) -> Result<QueryExpression, OrchestratorError> {
        let rejection = match validate(&expression, self.policy) {
            Ok(valid) => return Ok(valid.into_expression()),
            Err(rejection) => rejection,
        };

        let hint = if expression.scope_clauses().is_empty() {
            self.scope_hint(read, project)?
        } else {
            None
        };

        let Some(correction) = correct(&expression, &rejection, self.policy, hint.as_ref()) else {
            return Err(OrchestratorError::Validation {
                rejection: ValidationFailure::Grammar(rejection),
                expression: expression.preview(),
                corrected: false,
            });
        };

        match validate(&correction.expression, self.policy) {
            Ok(valid) => {
                tracing::debug!(applied = ?correction.applied, "corrected query");
                Ok(valid.into_expression())
            }
            Err(rejection) => Err(OrchestratorError::Validation {
                rejection: ValidationFailure::Grammar(rejection),
                expression: correction.expression.preview(),
                corrected: true,
            }),
        }
    }

    /// Scope the read's own context implies, most specific first.
    fn scope_hint(
        &mut self,
        read: &ReadRequest,
        project: Option<&Binding>,
    ) -> Result<Option<ScopeHint>, OrchestratorError> {
        if !read.trackers.is_empty() {
            let targets = read
                .trackers
                .iter()
                .map(|reference| self.tracker(reference, project))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Some(ScopeHint {
                kind: ScopeKind::Tracker,
                targets,
            }));
        }
        if !read.projects.is_empty() {
            let targets = read
                .projects
                .iter()
                .map(|reference| self.project(reference))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Some(ScopeHint {
                kind: ScopeKind::Project,
                targets,
            }));
        }
        Ok(project.map(|p| ScopeHint {
            kind: ScopeKind::Project,
            targets: vec![p.clone()],
        }))
    }

    /// Replace numeric identifier literals with registry bindings.
    fn bind_literals(
        &mut self,
        expression: QueryExpression,
        project: Option<&Binding>,
    ) -> Result<QueryExpression, OrchestratorError> {
        let mut replacements = Vec::new();
        for literal in expression.identifier_literals() {
            let reference = Reference::Id(literal.id);
            let binding = match literal.kind {
                IdentifierKind::Project => self.project(&reference)?,
                IdentifierKind::Tracker => self.tracker(&reference, project)?,
                IdentifierKind::Item => self.item(&reference)?,
            };
            replacements.push((literal.index, Token::Ident(binding)));
        }
        Ok(expression.with_replacements(replacements))
    }

    fn plan_writes(&mut self, writes: &[WriteRequest]) -> Result<(), OrchestratorError> {
        // Field changes to explicit items, grouped by canonical payload in
        // order of first appearance.
        let mut groups: Vec<(ChangePayload, Vec<Binding>)> = Vec::new();
        let mut result_set_writes: Vec<(CallId, ChangePayload)> = Vec::new();
        let mut singles: Vec<(Binding, ItemAction)> = Vec::new();

        for write in writes {
            if let Change::Fields(payload) = &write.change {
                if payload.is_empty() {
                    return Err(OrchestratorError::invalid_intent(
                        "a field change must set at least one field",
                    ));
                }
            }

            match &write.targets {
                WriteTargets::Read(label) => {
                    let Some(source) = self.labels.get(label).copied() else {
                        return Err(OrchestratorError::invalid_intent(format!(
                            "write targets unknown read `{label}`"
                        )));
                    };
                    let Change::Fields(payload) = &write.change else {
                        return Err(OrchestratorError::invalid_intent(format!(
                            "comments and transitions need explicit items, not the result set of `{label}`"
                        )));
                    };
                    let entry = (source, payload.clone());
                    if !result_set_writes.contains(&entry) {
                        result_set_writes.push(entry);
                    }
                }
                WriteTargets::Items(references) => {
                    if references.is_empty() {
                        return Err(OrchestratorError::invalid_intent(
                            "write names no target items",
                        ));
                    }
                    let items = references
                        .iter()
                        .map(|reference| self.item(reference))
                        .collect::<Result<Vec<_>, _>>()?;
                    match &write.change {
                        Change::Fields(payload) => {
                            let canonical = payload.canonical();
                            let index = match groups
                                .iter()
                                .position(|(p, _)| p.canonical() == canonical)
                            {
                                Some(index) => index,
                                None => {
                                    groups.push((payload.clone(), Vec::new()));
                                    groups.len() - 1
                                }
                            };
                            let group = &mut groups[index].1;
                            for item in items {
                                if !group.contains(&item) {
                                    group.push(item);
                                }
                            }
                        }
                        Change::Comment(text) => singles.extend(items.into_iter().map(|item| {
                            (item, ItemAction::Comment { text: text.clone() })
                        })),
                        Change::Transition(to) => singles.extend(items.into_iter().map(|item| {
                            (item, ItemAction::Transition { to: to.clone() })
                        })),
                    }
                }
            }
        }

        for (source, payload) in result_set_writes {
            let call_id = self.provisional();
            self.writes.push(ToolCall::new(
                call_id,
                CallArgs::BulkUpdate {
                    items: ItemSet::ResultOf(source),
                    payload,
                },
            ));
        }

        for (payload, items) in groups {
            if items.len() >= BULK_MIN_TARGETS {
                let call_id = self.provisional();
                self.writes.push(ToolCall::new(
                    call_id,
                    CallArgs::BulkUpdate {
                        items: ItemSet::Items(items),
                        payload,
                    },
                ));
                continue;
            }
            for item in items {
                let call_id = self.provisional();
                self.writes.push(ToolCall::new(
                    call_id,
                    CallArgs::SingleItemAction {
                        item,
                        action: ItemAction::Update {
                            payload: payload.clone(),
                        },
                    },
                ));
            }
        }

        for (item, action) in singles {
            let call_id = self.provisional();
            self.writes
                .push(ToolCall::new(call_id, CallArgs::SingleItemAction { item, action }));
        }

        Ok(())
    }
}

fn ambiguous(kind: IdentifierKind, reference: &Reference, count: usize) -> OrchestratorError {
    OrchestratorError::unresolvable(
        kind,
        reference.clone(),
        format!("{count} {kind}s match; refer to it by id"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{ReadRequest, RelationFilter};
    use almgate_kernel::{Identifier, Provenance, RemoteId, ToolKind};

    fn seen(
        registry: &mut IdentifierRegistry,
        kind: IdentifierKind,
        id: u64,
        name: &str,
        parent: Option<u64>,
        call: u64,
    ) {
        let tool = kind.discovered_by().unwrap_or(ToolKind::Query);
        registry.record(Identifier::observed(
            kind,
            RemoteId::new(id),
            Some(name.to_string()),
            parent.map(RemoteId::new),
            Provenance {
                call_id: CallId::new(call),
                tool,
            },
        ));
    }

    /// Project 1 "Platform" with tracker 42 "Requirements" and items 100..=103.
    fn warm_registry() -> IdentifierRegistry {
        let mut registry = IdentifierRegistry::new();
        seen(&mut registry, IdentifierKind::Project, 1, "Platform", None, 1);
        registry.note_discovery(DiscoveryScope::Projects);
        seen(&mut registry, IdentifierKind::Tracker, 42, "Requirements", Some(1), 2);
        registry.note_discovery(DiscoveryScope::TrackersOf(RemoteId::new(1)));
        for id in 100..=103 {
            seen(&mut registry, IdentifierKind::Item, id, &format!("REQ-{id}"), Some(42), 3);
        }
        registry
    }

    fn read(cbql: &str) -> ReadRequest {
        ReadRequest {
            cbql: cbql.to_string(),
            ..ReadRequest::default()
        }
    }

    fn plan(intent: &Intent, registry: &IdentifierRegistry) -> Result<Plan, OrchestratorError> {
        plan_intent(intent, &PolicyConfig::default(), registry, CallId::new(10))
    }

    fn fields(write: WriteTargets, payload: ChangePayload) -> WriteRequest {
        WriteRequest {
            targets: write,
            change: Change::Fields(payload),
        }
    }

    #[test]
    fn linked_items_bulk_update_plan() {
        let intent = Intent {
            reads: vec![ReadRequest {
                label: Some("linked".to_string()),
                relations: vec![RelationFilter {
                    predicate: "hasLinkTo".to_string(),
                    item: Reference::id(100),
                }],
                expand_relations: true,
                ..read("tracker.id IN (42)")
            }],
            writes: vec![fields(
                WriteTargets::Read("linked".to_string()),
                ChangePayload::default().with("status", "Done"),
            )],
            ..Intent::default()
        };

        let plan = plan(&intent, &warm_registry()).expect("plannable");
        insta::assert_snapshot!(plan.render(), @r#"
        1. [call-10] query[linked] tracker.id IN (42) AND hasLinkTo(100)
        2. [call-11] expand-relations results of call-10
        3. [call-12] bulk-update results of call-10 {"status":"Done"}
        "#);
        assert_eq!(plan.count(ToolKind::SingleItemAction), 0);
    }

    #[test]
    fn cold_registry_schedules_discovery_first() {
        let intent = Intent {
            project: Some(Reference::name("Platform")),
            reads: vec![read("tracker.id = 42 AND status = 'Open'")],
            ..Intent::default()
        };
        let plan = plan(&intent, &IdentifierRegistry::new()).expect("plannable");
        assert_eq!(
            plan.kinds(),
            vec![
                ToolKind::DiscoverProjects,
                ToolKind::DiscoverTrackers,
                ToolKind::Query
            ]
        );
        insta::assert_snapshot!(plan.render(), @r"
        1. [call-10] discover-projects
        2. [call-11] discover-trackers project=<project 'Platform' via call-10>
        3. [call-12] query tracker.id = <tracker #42 via call-11> AND status = 'Open'
        ");
    }

    #[test]
    fn missing_scope_is_injected_from_read_context() {
        let intent = Intent {
            reads: vec![ReadRequest {
                trackers: vec![Reference::id(42)],
                ..read("status = 'Open'")
            }],
            ..Intent::default()
        };
        let plan = plan(&intent, &warm_registry()).expect("corrected");
        let CallArgs::Query { expression, .. } = &plan.steps()[0].args else {
            panic!("expected a query step");
        };
        assert_eq!(
            expression.render().expect("bound"),
            "tracker.id IN (42) AND (status = 'Open')"
        );
    }

    #[test]
    fn missing_scope_without_context_is_a_validation_error() {
        let intent = Intent {
            reads: vec![read("status = 'Open'")],
            ..Intent::default()
        };
        let err = plan(&intent, &warm_registry()).expect_err("no scope to infer");
        assert!(matches!(
            err,
            OrchestratorError::Validation {
                rejection: ValidationFailure::Grammar(almgate_kernel::GrammarRejection::ScopeMissing { found: 0 }),
                corrected: false,
                ..
            }
        ));
    }

    #[test]
    fn unknown_item_is_unresolvable() {
        let intent = Intent {
            reads: vec![read("tracker.id = 42 AND hasParent(999)")],
            ..Intent::default()
        };
        let err = plan(&intent, &warm_registry()).expect_err("item 999 never seen");
        assert_eq!(err.kind(), "unresolvable_reference");
    }

    #[test]
    fn item_ids_in_plain_filters_must_come_from_earlier_results() {
        let intent = Intent {
            project: Some(Reference::id(1)),
            reads: vec![read("tracker.id = 42 AND id IN (101, 999999)")],
            ..Intent::default()
        };
        let err = plan(&intent, &IdentifierRegistry::new()).expect_err("no item is known cold");
        assert_eq!(err.kind(), "unresolvable_reference");

        let err = plan(&intent, &warm_registry()).expect_err("item 999999 never seen");
        assert!(matches!(
            &err,
            OrchestratorError::UnresolvableReference {
                kind: IdentifierKind::Item,
                reference: Reference::Id(id),
                ..
            } if *id == RemoteId::new(999999)
        ));
    }

    #[test]
    fn known_item_ids_in_filters_are_bound() {
        let intent = Intent {
            reads: vec![read("tracker.id = 42 AND item.id = 101")],
            ..Intent::default()
        };
        let plan = plan(&intent, &warm_registry()).expect("plannable");
        let items: Vec<u64> = plan.steps()[0]
            .bindings()
            .into_iter()
            .filter_map(|b| b.known())
            .filter(|i| i.kind() == IdentifierKind::Item)
            .map(|i| i.id().get())
            .collect();
        assert_eq!(items, vec![101]);
    }

    #[test]
    fn tracker_missing_after_discovery_is_unresolvable() {
        let intent = Intent {
            project: Some(Reference::id(1)),
            reads: vec![read("tracker.id = 77")],
            ..Intent::default()
        };
        let err = plan(&intent, &warm_registry()).expect_err("project 1 has no tracker 77");
        assert!(err.to_string().contains("not among the trackers discovered"));
    }

    #[test]
    fn identical_payloads_merge_into_one_bulk_update() {
        let done = ChangePayload::default().with("status", "Done");
        let intent = Intent {
            writes: vec![
                fields(WriteTargets::Items(vec![Reference::id(100)]), done.clone()),
                fields(
                    WriteTargets::Items(vec![Reference::id(101), Reference::id(102)]),
                    done,
                ),
                fields(
                    WriteTargets::Items(vec![Reference::id(103)]),
                    ChangePayload::default().with("status", "Rejected"),
                ),
            ],
            ..Intent::default()
        };
        let plan = plan(&intent, &warm_registry()).expect("plannable");
        assert_eq!(plan.count(ToolKind::BulkUpdate), 1);
        assert_eq!(plan.count(ToolKind::SingleItemAction), 1);
        insta::assert_snapshot!(plan.render(), @r#"
        1. [call-10] bulk-update [100, 101, 102] {"status":"Done"}
        2. [call-11] single-item-action item=103 update {"status":"Rejected"}
        "#);
    }

    #[test]
    fn two_targets_sharing_a_payload_are_always_one_bulk_update() {
        let intent = Intent {
            writes: vec![fields(
                WriteTargets::Items(vec![Reference::id(100), Reference::id(101)]),
                ChangePayload::default().with("status", "Done"),
            )],
            ..Intent::default()
        };
        let plan = plan(&intent, &warm_registry()).expect("plannable");
        assert_eq!(BULK_MIN_TARGETS, 2);
        assert_eq!(plan.count(ToolKind::BulkUpdate), 1);
        assert_eq!(plan.count(ToolKind::SingleItemAction), 0);
    }

    #[test]
    fn comment_on_result_set_is_rejected() {
        let intent = Intent {
            reads: vec![ReadRequest {
                label: Some("open".to_string()),
                ..read("tracker.id = 42")
            }],
            writes: vec![WriteRequest {
                targets: WriteTargets::Read("open".to_string()),
                change: Change::Comment("seen".to_string()),
            }],
            ..Intent::default()
        };
        let err = plan(&intent, &warm_registry()).expect_err("needs explicit items");
        assert_eq!(err.kind(), "invalid_intent");
    }

    #[test]
    fn every_known_binding_was_produced_before_the_plan() {
        let registry = warm_registry();
        let intent = Intent {
            reads: vec![read("tracker.id = 42 AND hasChild(101)")],
            ..Intent::default()
        };
        let plan = plan(&intent, &registry).expect("plannable");
        for step in plan.steps() {
            for binding in step.bindings() {
                let identifier = binding.known().expect("warm registry needs no discovery");
                assert!(identifier.provenance().call_id < step.call_id);
            }
        }
    }
}
