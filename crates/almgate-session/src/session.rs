//! One conversation's orchestration state.
//!
//! A session owns its registry and governor outright; nothing is shared
//! between sessions except the immutable policy.

use crate::adapter::ToolAdapter;
use crate::executor::{Execution, RunReport};
use crate::governor::{RateLimitGovernor, RateLimitState};
use crate::intent::Intent;
use crate::planner::plan_intent;
use crate::registry::IdentifierRegistry;
use almgate_kernel::{CallId, IdentifierKind, OrchestratorError, Plan, PolicyConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    policy: Arc<PolicyConfig>,
    pub(crate) registry: IdentifierRegistry,
    pub(crate) governor: RateLimitGovernor,
    next_call_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session: Uuid,
    pub started_at: DateTime<Utc>,
    pub rate_limit: RateLimitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<DateTime<Utc>>,
    pub projects: usize,
    pub trackers: usize,
    pub items: usize,
    pub next_call_id: CallId,
}

impl Session {
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "session started");
        Self {
            id,
            started_at: Utc::now(),
            policy,
            registry: IdentifierRegistry::new(),
            governor: RateLimitGovernor::new(),
            next_call_id: 1,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn registry(&self) -> &IdentifierRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.governor
    }

    /// Plan an intent against the registry as it stands. Call IDs are
    /// session-unique and increase across plans.
    pub fn plan(&mut self, intent: &Intent) -> Result<Plan, OrchestratorError> {
        let plan = plan_intent(
            intent,
            &self.policy,
            &self.registry,
            CallId::new(self.next_call_id),
        )?;
        self.next_call_id += plan.len() as u64;
        Ok(plan)
    }

    pub fn execute<'a>(&'a mut self, plan: Plan, adapter: &'a dyn ToolAdapter) -> Execution<'a> {
        Execution::new(self, plan, adapter)
    }

    /// Plan and run to the end. Planning failures dispatch nothing.
    pub async fn run(
        &mut self,
        intent: &Intent,
        adapter: &dyn ToolAdapter,
    ) -> Result<RunReport, OrchestratorError> {
        let plan = self.plan(intent)?;
        Ok(self.execute(plan, adapter).run_to_end().await)
    }

    /// Explicit external reset: reopen dispatch. The registry is kept.
    pub fn reset(&mut self) -> RateLimitState {
        let previous = self.governor.reset();
        tracing::info!(session = %self.id, previous = ?previous, "rate-limit governor reset");
        previous
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session: self.id,
            started_at: self.started_at,
            rate_limit: self.governor.state(),
            seconds_remaining: self.governor.seconds_remaining(),
            halted_at: self.governor.halted_at(),
            projects: self.registry.count(IdentifierKind::Project),
            trackers: self.registry.count(IdentifierKind::Tracker),
            items: self.registry.count(IdentifierKind::Item),
            next_call_id: CallId::new(self.next_call_id),
        }
    }
}
