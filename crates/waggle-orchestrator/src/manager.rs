use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use waggle_core::{
    OutputRoute, Position, PositionStatus, RoleTemplate, Task, TaskSpec, TaskStatus,
    WaggleError, WaggleResult,
};
use waggle_store::{validate_key, PositionStore};

/// Predicate over a completed task's result, deciding whether a route fires.
pub type RouteCondition = Arc<dyn Fn(&Value) -> WaggleResult<bool> + Send + Sync>;
/// Mapping from a completed task's result to the forwarded payload.
pub type RouteTransform = Arc<dyn Fn(&Value) -> WaggleResult<Value> + Send + Sync>;

/// Executable half of an output route. Behavior, not data: closures are never
/// persisted, so after a restart only the flags on [`OutputRoute`] survive and
/// behavior must be re-registered against the route id.
#[derive(Clone, Default)]
pub struct RouteBehavior {
    pub condition: Option<RouteCondition>,
    pub transform: Option<RouteTransform>,
}

impl RouteBehavior {
    pub fn with_condition(mut self, condition: RouteCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_transform(mut self, transform: RouteTransform) -> Self {
        self.transform = Some(transform);
        self
    }
}

/// CRUD and task-queue operations over the position store.
///
/// Every operation is a read-modify-write of the whole position record. The
/// orchestrator serializes execution per position via the `busy` guard, but
/// administrative calls from other callers are not inherently serialized —
/// a known limitation of this design, carried deliberately.
pub struct PositionManager {
    store: Arc<dyn PositionStore>,
    /// In-memory route behavior registry, keyed by route id. Session-scoped.
    behaviors: RwLock<HashMap<Uuid, RouteBehavior>>,
}

impl PositionManager {
    pub fn new(store: Arc<dyn PositionStore>) -> Self {
        Self {
            store,
            behaviors: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    async fn require_position(&self, id: &str) -> WaggleResult<Position> {
        self.store
            .load_position(id)
            .await?
            .ok_or_else(|| WaggleError::Position(format!("position '{id}' not found")))
    }

    /// Create a new position from a named template.
    ///
    /// Fails if the template is unknown or a position with the id already
    /// exists. Generates a random id when none is supplied.
    pub async fn create_position(
        &self,
        template_name: &str,
        id: Option<String>,
        config: Option<Value>,
    ) -> WaggleResult<Position> {
        if self.store.load_template(template_name).await?.is_none() {
            return Err(WaggleError::Template(format!(
                "template '{template_name}' not found"
            )));
        }
        let id = id.unwrap_or_else(generated_position_id);
        validate_key(&id)?;
        if self.store.load_position(&id).await?.is_some() {
            return Err(WaggleError::Position(format!(
                "position '{id}' already exists"
            )));
        }

        let mut position = Position::new(id, template_name);
        position.config = config;
        self.store.save_position(&position).await?;
        info!(position_id = %position.id, template = template_name, "position created");
        Ok(position)
    }

    /// Delete a position and all its persisted state.
    ///
    /// In-flight executions must be cancelled by the caller first; this only
    /// removes the record and drops the position's registered route behaviors.
    pub async fn destroy_position(&self, id: &str) -> WaggleResult<()> {
        let position = self.require_position(id).await?;
        {
            let mut behaviors = self.behaviors.write();
            for route in &position.output_routes {
                behaviors.remove(&route.id);
            }
        }
        self.store.delete_position(id).await?;
        info!(position_id = id, "position destroyed");
        Ok(())
    }

    pub async fn get_position(&self, id: &str) -> WaggleResult<Option<Position>> {
        self.store.load_position(id).await
    }

    pub async fn list_positions(&self) -> WaggleResult<Vec<Position>> {
        self.store.load_all_positions().await
    }

    pub async fn template(&self, name: &str) -> WaggleResult<Option<RoleTemplate>> {
        self.store.load_template(name).await
    }

    pub async fn register_template(&self, template: &RoleTemplate) -> WaggleResult<()> {
        self.store.save_template(template).await
    }

    /// Append a fresh pending task to the target position's queue.
    pub async fn enqueue_task(&self, spec: TaskSpec) -> WaggleResult<Task> {
        let mut position = self.require_position(&spec.target_position_id).await?;
        let task = Task::new(spec);
        position.task_queue.push(task.clone());
        position.updated_at = Utc::now();
        self.store.save_position(&position).await?;
        Ok(task)
    }

    /// Take the next task to run: highest priority first, earliest
    /// `created_at` within a priority band. Marks it running and records it
    /// as the position's current task. Returns `Ok(None)` when nothing is
    /// pending.
    pub async fn dequeue_task(&self, position_id: &str) -> WaggleResult<Option<Task>> {
        let mut position = self.require_position(position_id).await?;

        let mut best: Option<usize> = None;
        for (i, task) in position.task_queue.iter().enumerate() {
            if task.status != TaskStatus::Pending {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    let current = &position.task_queue[b];
                    let wins = task.priority.rank() > current.priority.rank()
                        || (task.priority.rank() == current.priority.rank()
                            && task.created_at < current.created_at);
                    if wins {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        let Some(index) = best else {
            return Ok(None);
        };

        position.task_queue[index].status = TaskStatus::Running;
        position.current_task_id = Some(position.task_queue[index].id);
        position.updated_at = Utc::now();
        let task = position.task_queue[index].clone();
        self.store.save_position(&position).await?;
        Ok(Some(task))
    }

    /// Mark a task done and record its result.
    pub async fn complete_task(
        &self,
        position_id: &str,
        task_id: Uuid,
        result: Value,
    ) -> WaggleResult<Task> {
        self.finish_task(position_id, task_id, TaskStatus::Done, result)
            .await
    }

    /// Mark a task failed; the error message becomes the task's result.
    pub async fn fail_task(
        &self,
        position_id: &str,
        task_id: Uuid,
        error: impl Into<String>,
    ) -> WaggleResult<Task> {
        self.finish_task(
            position_id,
            task_id,
            TaskStatus::Failed,
            Value::String(error.into()),
        )
        .await
    }

    async fn finish_task(
        &self,
        position_id: &str,
        task_id: Uuid,
        status: TaskStatus,
        result: Value,
    ) -> WaggleResult<Task> {
        let mut position = self.require_position(position_id).await?;
        let index = position
            .task_queue
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| {
                WaggleError::Task(format!(
                    "task {task_id} not found on position '{position_id}'"
                ))
            })?;

        {
            let task = &mut position.task_queue[index];
            if task.status.is_terminal() {
                return Err(WaggleError::Task(format!(
                    "task {task_id} is already terminal ({:?})",
                    task.status
                )));
            }
            task.status = status;
            task.result = Some(result);
            task.completed_at = Some(Utc::now());
        }
        let finished = position.task_queue[index].clone();

        if position.current_task_id == Some(task_id) {
            position.current_task_id = None;
        }
        position.updated_at = Utc::now();
        self.store.save_position(&position).await?;
        Ok(finished)
    }

    /// Register a forwarding rule for a position.
    ///
    /// The rule's data is persisted (with `has_condition` / `has_transform`
    /// flags only); any closures go into the in-memory behavior registry.
    pub async fn add_output_route(
        &self,
        position_id: &str,
        task_type: &str,
        target_position_id: &str,
        behavior: RouteBehavior,
    ) -> WaggleResult<OutputRoute> {
        let mut position = self.require_position(position_id).await?;
        let mut route = OutputRoute::new(task_type, target_position_id);
        route.has_condition = behavior.condition.is_some();
        route.has_transform = behavior.transform.is_some();
        position.output_routes.push(route.clone());
        position.updated_at = Utc::now();
        self.store.save_position(&position).await?;

        if route.has_condition || route.has_transform {
            self.behaviors.write().insert(route.id, behavior);
        }
        Ok(route)
    }

    /// Re-attach behavior to a persisted route after a restart.
    pub fn register_route_behavior(&self, route_id: Uuid, behavior: RouteBehavior) {
        self.behaviors.write().insert(route_id, behavior);
    }

    pub fn route_behavior(&self, route_id: Uuid) -> Option<RouteBehavior> {
        self.behaviors.read().get(&route_id).cloned()
    }

    pub async fn set_status(&self, position_id: &str, status: PositionStatus) -> WaggleResult<()> {
        let mut position = self.require_position(position_id).await?;
        position.status = status;
        position.updated_at = Utc::now();
        self.store.save_position(&position).await
    }

    /// Shallow patch of the position record. The `id` field is immutable and
    /// silently skipped even when present in the patch.
    pub async fn update_position(&self, position_id: &str, patch: Value) -> WaggleResult<Position> {
        let position = self.require_position(position_id).await?;
        let mut doc = serde_json::to_value(&position)?;

        match (&mut doc, patch) {
            (Value::Object(doc_map), Value::Object(patch_map)) => {
                for (key, value) in patch_map {
                    if key == "id" {
                        continue;
                    }
                    doc_map.insert(key, value);
                }
            }
            _ => {
                return Err(WaggleError::Position(
                    "position patch must be a JSON object".to_string(),
                ));
            }
        }

        let mut updated: Position = serde_json::from_value(doc)?;
        updated.updated_at = Utc::now();
        self.store.save_position(&updated).await?;
        Ok(updated)
    }
}

fn generated_position_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("pos-{}", &uuid[..8])
}
