//! Execution context passed explicitly through the engine.
//!
//! Correlation state travels by parameter - orchestrator to sandbox to
//! trace - never through module-level or task-local ambience.

use crate::{Run, RunId, StepId, TriggerType, WorkflowId, WorkflowVersionId};
use serde::{Deserialize, Serialize};

/// Per-run correlation context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version_id: WorkflowVersionId,
    pub trigger: TriggerType,
    /// Correlates log/trace records across workers for one run
    pub correlation_id: String,
    /// Set while a specific step is executing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
}

impl ExecutionContext {
    pub fn for_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            workflow_id: run.workflow_id.clone(),
            workflow_version_id: run.workflow_version_id.clone(),
            trigger: run.trigger,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            step_id: None,
        }
    }

    /// Context narrowed to a single step.
    pub fn for_step(&self, step_id: StepId) -> Self {
        let mut ctx = self.clone();
        ctx.step_id = Some(step_id);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonObject;

    #[test]
    fn step_context_keeps_correlation_id() {
        let run = Run::new(
            WorkflowId::generate(),
            WorkflowVersionId::generate(),
            TriggerType::Manual,
            JsonObject::new(),
        );
        let ctx = ExecutionContext::for_run(&run);
        let step_ctx = ctx.for_step(StepId::new("s1"));

        assert_eq!(step_ctx.correlation_id, ctx.correlation_id);
        assert_eq!(step_ctx.run_id, run.id);
        assert_eq!(step_ctx.step_id, Some(StepId::new("s1")));
        assert_eq!(ctx.step_id, None);
    }
}
