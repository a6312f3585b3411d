use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use waggle_core::{CancelToken, Position, RoleTemplate, Task, WaggleResult};

/// What an execution produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Model/API spend attributed to this execution.
    pub cost_usd: f64,
    /// Optional structured output, carried into the task's completion result.
    #[serde(default)]
    pub output: Option<Value>,
}

/// The opaque collaborator that actually runs a task's business logic.
///
/// The orchestrator never interprets payloads or calls a model itself; it
/// hands (position, template, task) to the executor and waits. Implementors
/// are expected to observe the cancellation token and return promptly when it
/// fires — the orchestrator does not force-kill an execution.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        position: &Position,
        template: &RoleTemplate,
        task: &Task,
        cancel: CancelToken,
    ) -> WaggleResult<ExecutionReport>;
}
