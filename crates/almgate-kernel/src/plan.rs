//! Plans: ordered, gate-checked sequences of tool calls.

use crate::call::{ToolCall, ToolKind};
use crate::error::OrchestratorError;
use crate::gate::check_order;
use crate::identifier::CallId;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const PLAN_DIGEST_PREFIX: &str = "plan1_";

/// An immutable plan. Construction runs the ordering gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    steps: Vec<ToolCall>,
}

impl Plan {
    pub fn new(steps: Vec<ToolCall>) -> Result<Self, OrchestratorError> {
        check_order(&steps)?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[ToolCall] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, call_id: CallId) -> Option<&ToolCall> {
        self.steps.iter().find(|s| s.call_id == call_id)
    }

    pub fn count(&self, kind: ToolKind) -> usize {
        self.steps.iter().filter(|s| s.kind() == kind).count()
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        self.steps.iter().map(ToolCall::kind).collect()
    }

    /// `plan1_<sha256>` over the canonical JSON of the steps.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(&self.steps).unwrap_or_default();
        let hash = Sha256::digest(&canonical);
        let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
        format!("{PLAN_DIGEST_PREFIX}{hex}")
    }

    /// Numbered listing, one step per line.
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. [{}] {}", i + 1, step.call_id, step.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
