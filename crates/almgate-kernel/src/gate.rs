//! Relation expansion gate and structural plan order.
//!
//! [`check_order`] runs when a plan is built and again before dispatch. Any
//! failure is an [`OrchestratorError::OrderingViolation`]: the steps were
//! assembled wrongly, and nothing downstream may repair them.
//!
//! Checked:
//! - call IDs are unique
//! - phases never go backwards (discovery, query, expansion, write)
//! - a step consuming a result set names a query that runs strictly earlier
//! - a pending identifier names an earlier discovery call that yields its kind

use crate::call::{ToolCall, ToolKind};
use crate::error::OrchestratorError;
use crate::identifier::{Binding, CallId};
use std::collections::BTreeMap;

pub fn check_order(steps: &[ToolCall]) -> Result<(), OrchestratorError> {
    let mut seen: BTreeMap<CallId, ToolKind> = BTreeMap::new();
    let mut last_phase = None;

    for step in steps {
        let kind = step.kind();

        if seen.contains_key(&step.call_id) {
            return Err(OrchestratorError::ordering(
                step.call_id,
                "call id appears more than once in the plan",
            ));
        }

        let phase = kind.phase();
        if let Some(previous) = last_phase {
            if phase < previous {
                return Err(OrchestratorError::ordering(
                    step.call_id,
                    format!("{kind} scheduled after a later-phase step ({previous:?})"),
                ));
            }
        }
        last_phase = Some(phase);

        if let Some(source) = step.item_source() {
            match seen.get(&source) {
                Some(ToolKind::Query) => {}
                Some(other) => {
                    return Err(OrchestratorError::ordering(
                        step.call_id,
                        format!("{kind} consumes {source}, which is a {other} step, not a query"),
                    ));
                }
                None => {
                    return Err(OrchestratorError::ordering(
                        step.call_id,
                        format!("{kind} consumes {source}, which does not run earlier"),
                    ));
                }
            }
        }

        for binding in step.bindings() {
            let Binding::Pending {
                kind: wanted,
                reference,
                producer,
            } = binding
            else {
                continue;
            };
            match seen.get(producer) {
                Some(tool) if tool.yields() == Some(*wanted) && *tool != ToolKind::Query => {}
                Some(tool) => {
                    return Err(OrchestratorError::ordering(
                        step.call_id,
                        format!(
                            "{wanted} {reference} is expected from {producer}, a {tool} step that cannot produce it"
                        ),
                    ));
                }
                None => {
                    return Err(OrchestratorError::ordering(
                        step.call_id,
                        format!(
                            "{wanted} {reference} is expected from {producer}, which does not run earlier"
                        ),
                    ));
                }
            }
        }

        seen.insert(step.call_id, kind);
    }

    Ok(())
}
