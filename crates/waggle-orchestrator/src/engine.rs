use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use waggle_core::{
    event_types, route_pattern_matches, CancelToken, Event, OutputRoute, Position,
    PositionStatus, RoleTemplate, Semaphore, Task, TaskSpec, WaggleError, WaggleResult,
};
use waggle_store::{EventBus, HandlerId};

use crate::config::OrchestratorConfig;
use crate::executor::Executor;
use crate::manager::{PositionManager, RouteBehavior};

/// The scheduler: listens to the event bus for inter-position task events,
/// dispatches tasks into the manager, and drives per-position execution
/// bounded by the global semaphore and a per-task timeout.
pub struct Orchestrator {
    manager: Arc<PositionManager>,
    bus: Arc<EventBus>,
    executor: Arc<dyn Executor>,
    semaphore: Semaphore,
    config: OrchestratorConfig,
    running: AtomicBool,
    bus_handler: Mutex<Option<HandlerId>>,
    inflight: Mutex<HashMap<String, Inflight>>,
    completed_tasks: AtomicU64,
    total_cost_usd: Mutex<f64>,
    /// Weak self-handle for spawning fire-and-forget work.
    self_ref: Weak<Orchestrator>,
}

struct Inflight {
    token: CancelToken,
    /// `None` while the claiming trigger is still between the claim and the
    /// spawn.
    handle: Option<JoinHandle<()>>,
}

/// Read-only view of one position for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub id: String,
    pub status: PositionStatus,
    pub current_task_id: Option<Uuid>,
}

/// Aggregate view across all positions.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub positions: Vec<PositionSnapshot>,
    pub pending_tasks: usize,
    pub completed_tasks: u64,
    pub total_cost_usd: f64,
}

impl Orchestrator {
    /// Build an orchestrator over the given collaborators.
    ///
    /// Fails if the configured concurrency bound is invalid.
    pub fn new(
        manager: Arc<PositionManager>,
        bus: Arc<EventBus>,
        executor: Arc<dyn Executor>,
        config: OrchestratorConfig,
    ) -> WaggleResult<Arc<Self>> {
        let semaphore = Semaphore::new(config.max_concurrent)?;
        Ok(Arc::new_cyclic(|weak| Self {
            manager,
            bus,
            executor,
            semaphore,
            config,
            running: AtomicBool::new(false),
            bus_handler: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
            completed_tasks: AtomicU64::new(0),
            total_cost_usd: Mutex::new(0.0),
            self_ref: weak.clone(),
        }))
    }

    pub fn manager(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin reacting to task events. Idempotent.
    ///
    /// Registers a single wildcard handler that re-dispatches inter-position
    /// `task.*` events carrying a target — except `task.created`, whose echo
    /// would otherwise feed back into dispatch forever.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.self_ref.clone();
        let id = self.bus.on_any(move |event| {
            let weak = weak.clone();
            async move {
                let Some(orch) = weak.upgrade() else {
                    return Ok(());
                };
                orch.handle_task_event(event).await
            }
        });
        *self.bus_handler.lock() = Some(id);
        info!(
            max_concurrent = self.config.max_concurrent,
            timeout_secs = self.config.task_timeout_secs,
            "orchestrator started"
        );
    }

    /// Stop the orchestrator. Idempotent.
    ///
    /// Unregisters the bus handler, cancels every in-flight execution's
    /// token, and waits for all execution futures to settle (individual
    /// failures ignored) — no execution is left running on return.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.bus_handler.lock().take() {
            self.bus.off(id);
        }

        let drained: Vec<Inflight> = self.inflight.lock().drain().map(|(_, v)| v).collect();
        let count = drained.len();
        for entry in &drained {
            entry.token.cancel();
        }
        for entry in drained {
            if let Some(handle) = entry.handle {
                let _ = handle.await;
            }
        }
        info!(cancelled = count, "orchestrator stopped");
    }

    async fn handle_task_event(&self, event: Event) -> WaggleResult<()> {
        if !event.event_type.starts_with(event_types::TASK_PREFIX) {
            return Ok(());
        }
        // A task.created echo is the result of dispatch_task itself;
        // re-dispatching it would loop forever.
        if event.event_type == event_types::TASK_CREATED {
            return Ok(());
        }
        let Some(target) = event.target_position_id.clone() else {
            return Ok(());
        };

        let priority = event
            .payload
            .get("priority")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let task_type = event
            .payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(&event.event_type)
            .to_string();
        let payload = event
            .payload
            .get("payload")
            .cloned()
            .unwrap_or_else(|| event.payload.clone());

        let spec = TaskSpec {
            source_position_id: event.source_position_id.clone(),
            target_position_id: target,
            task_type,
            payload,
            priority,
        };
        self.dispatch_task(spec).await.map(|_| ())
    }

    /// Enqueue a task for its target position and announce it.
    ///
    /// Returns the persisted task immediately; execution is observed later
    /// via events or state polling, never through this call. The trigger of
    /// the target is fire-and-forget — its errors are logged, not returned.
    pub async fn dispatch_task(&self, spec: TaskSpec) -> WaggleResult<Task> {
        if self
            .manager
            .get_position(&spec.target_position_id)
            .await?
            .is_none()
        {
            return Err(WaggleError::Position(format!(
                "cannot dispatch to unknown position '{}'",
                spec.target_position_id
            )));
        }

        let task = self.manager.enqueue_task(spec).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            target = %task.target_position_id,
            priority = ?task.priority,
            "task dispatched"
        );

        self.bus
            .emit(Event::new(
                event_types::TASK_CREATED,
                task.source_position_id.clone(),
                Some(task.target_position_id.clone()),
                json!({
                    "task_id": task.id,
                    "type": task.task_type,
                    "priority": task.priority,
                }),
            ))
            .await?;

        if self.is_running() {
            self.spawn_trigger(task.target_position_id.clone());
        }
        Ok(task)
    }

    fn spawn_trigger(&self, position_id: String) {
        let Some(orch) = self.self_ref.upgrade() else {
            return;
        };
        // Boxed to break the dispatch → trigger → execute → dispatch type
        // cycle between the async fns.
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            if let Err(e) = orch.trigger_position(&position_id).await {
                warn!(position_id = %position_id, error = %e, "trigger failed");
            }
        });
        tokio::spawn(fut);
    }

    /// Start executing the next pending task of a position, if any.
    ///
    /// No-op when the position is missing, already busy, or idle with an
    /// empty queue. A position in `error` is deliberately not blocked: the
    /// next successful execution clears it back to idle.
    pub async fn trigger_position(&self, position_id: &str) -> WaggleResult<()> {
        // Claim the position in the in-flight table before the first await.
        // Two concurrent triggers must not both pass the busy check, both
        // dequeue, and run side by side; the claim makes exactly one of them
        // proceed.
        let token = CancelToken::new();
        {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(position_id) {
                return Ok(());
            }
            inflight.insert(
                position_id.to_string(),
                Inflight {
                    token: token.clone(),
                    handle: None,
                },
            );
        }

        match self.start_claimed_execution(position_id, token).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.inflight.lock().remove(position_id);
                Ok(())
            }
            Err(e) => {
                self.inflight.lock().remove(position_id);
                Err(e)
            }
        }
    }

    /// Runs under an in-flight claim held by `trigger_position`. Returns
    /// whether an execution was spawned; on `false` or error the caller
    /// releases the claim, otherwise the execution's settlement does.
    async fn start_claimed_execution(
        &self,
        position_id: &str,
        token: CancelToken,
    ) -> WaggleResult<bool> {
        let Some(orch) = self.self_ref.upgrade() else {
            return Ok(false);
        };
        let Some(position) = self.manager.get_position(position_id).await? else {
            return Ok(false);
        };
        if position.status == PositionStatus::Busy {
            return Ok(false);
        }
        let Some(task) = self.manager.dequeue_task(position_id).await? else {
            return Ok(false);
        };
        let template = self
            .manager
            .template(&position.template_name)
            .await?
            .ok_or_else(|| {
                WaggleError::Template(format!(
                    "template '{}' missing for position '{position_id}'",
                    position.template_name
                ))
            })?;

        self.manager
            .set_status(position_id, PositionStatus::Busy)
            .await?;

        let timeout = Duration::from_secs(
            template.timeout_secs.unwrap_or(self.config.task_timeout_secs),
        );
        let timer = {
            let token = token.clone();
            let pid = position_id.to_string();
            let task_id = task.id;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(position_id = %pid, task_id = %task_id, "task timed out, cancelling");
                token.cancel();
            })
        };

        // The execution is gated on a oneshot so it cannot deregister itself
        // from the in-flight table before its handle is recorded.
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let pid = position_id.to_string();
        let exec_token = token.clone();
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = started_rx.await;
            orch.run_execution(pid, template, task, exec_token, timer).await;
        });
        let handle = tokio::spawn(fut);
        {
            let mut inflight = self.inflight.lock();
            match inflight.get_mut(position_id) {
                Some(entry) => entry.handle = Some(handle),
                // stop() drained the claim while we were spawning; cancel so
                // the execution unwinds as soon as it starts.
                None => token.cancel(),
            }
        }
        let _ = started_tx.send(());
        Ok(true)
    }

    async fn run_execution(
        &self,
        position_id: String,
        template: RoleTemplate,
        task: Task,
        token: CancelToken,
        timer: JoinHandle<()>,
    ) {
        self.semaphore
            .with_lock(|| self.execute_task(&position_id, &template, &task, token))
            .await;

        // Settlement path runs in all cases.
        timer.abort();
        self.inflight.lock().remove(&position_id);

        match self.manager.get_position(&position_id).await {
            Ok(Some(position)) => {
                // Restore idle only from busy; a failure already moved the
                // position to error and that must stand.
                if position.status == PositionStatus::Busy {
                    if let Err(e) = self
                        .manager
                        .set_status(&position_id, PositionStatus::Idle)
                        .await
                    {
                        error!(position_id = %position_id, error = %e, "failed to restore idle status");
                    }
                }
            }
            Ok(None) => return, // destroyed mid-flight
            Err(e) => {
                error!(position_id = %position_id, error = %e, "failed to reload position after execution");
                return;
            }
        }

        if !self.is_running() {
            return;
        }
        // Re-read after the idle restore: a task enqueued while the status
        // was still busy had its own trigger no-op against this execution,
        // so the re-trigger decision needs the freshest pending count.
        match self.manager.get_position(&position_id).await {
            Ok(Some(position)) if position.pending_count() > 0 => {
                self.spawn_trigger(position_id);
            }
            Ok(_) => {}
            Err(e) => {
                error!(position_id = %position_id, error = %e, "failed to reload position after execution");
            }
        }
    }

    async fn execute_task(
        &self,
        position_id: &str,
        template: &RoleTemplate,
        task: &Task,
        token: CancelToken,
    ) {
        let position = match self.manager.get_position(position_id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!(position_id, "position vanished before execution");
                return;
            }
            Err(e) => {
                error!(position_id, error = %e, "failed to load position for execution");
                return;
            }
        };

        info!(
            position_id,
            task_id = %task.id,
            task_type = %task.task_type,
            "executing task"
        );

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(WaggleError::Cancelled(format!(
                "task {} cancelled before completion", task.id
            ))),
            result = self.executor.execute(&position, template, task, token.clone()) => result,
        };

        match outcome {
            Ok(report) => {
                let result = json!({
                    "status": "completed",
                    "cost_usd": report.cost_usd,
                    "output": report.output,
                });
                if let Err(e) = self
                    .manager
                    .complete_task(position_id, task.id, result.clone())
                    .await
                {
                    error!(position_id, task_id = %task.id, error = %e, "failed to record completion");
                    return;
                }
                *self.total_cost_usd.lock() += report.cost_usd;
                self.completed_tasks.fetch_add(1, Ordering::SeqCst);
                info!(
                    position_id,
                    task_id = %task.id,
                    cost_usd = report.cost_usd,
                    "task completed"
                );

                if let Err(e) = self
                    .bus
                    .emit(Event::new(
                        event_types::TASK_COMPLETED,
                        position_id,
                        None,
                        json!({
                            "task_id": task.id,
                            "type": task.task_type,
                            "cost_usd": report.cost_usd,
                        }),
                    ))
                    .await
                {
                    error!(task_id = %task.id, error = %e, "failed to emit completion event");
                }

                self.forward_results(&position, task, &result).await;
            }
            Err(e) => {
                error!(position_id, task_id = %task.id, error = %e, "task failed");
                if let Err(err) = self.manager.fail_task(position_id, task.id, e.to_string()).await
                {
                    error!(task_id = %task.id, error = %err, "failed to record task failure");
                }
                if let Err(err) = self
                    .manager
                    .set_status(position_id, PositionStatus::Error)
                    .await
                {
                    error!(position_id, error = %err, "failed to set error status");
                }
                if let Err(err) = self
                    .bus
                    .emit(Event::new(
                        event_types::TASK_FAILED,
                        position_id,
                        None,
                        json!({
                            "task_id": task.id,
                            "type": task.task_type,
                            "error": e.to_string(),
                        }),
                    ))
                    .await
                {
                    error!(task_id = %task.id, error = %err, "failed to emit failure event");
                }
            }
        }
    }

    /// Evaluate every output route of the position against a completed task
    /// and forward the result to each matching target.
    ///
    /// A condition or transform that fails is logged and skips that route
    /// only; the forwarded task keeps the original task's type and priority.
    async fn forward_results(&self, position: &Position, task: &Task, result: &Value) {
        for route in &position.output_routes {
            if !route_pattern_matches(&route.task_type, &task.task_type) {
                continue;
            }
            let behavior = self
                .manager
                .route_behavior(route.id)
                .unwrap_or_default();

            if let Some(payload) = self.evaluate_route(route, &behavior, result) {
                let spec = TaskSpec {
                    source_position_id: position.id.clone(),
                    target_position_id: route.target_position_id.clone(),
                    task_type: task.task_type.clone(),
                    payload,
                    priority: task.priority,
                };
                match self.dispatch_task(spec).await {
                    Ok(forwarded) => info!(
                        route_id = %route.id,
                        forwarded_task_id = %forwarded.id,
                        target = %route.target_position_id,
                        "result forwarded"
                    ),
                    Err(e) => warn!(
                        route_id = %route.id,
                        target = %route.target_position_id,
                        error = %e,
                        "route forwarding failed"
                    ),
                }
            }
        }
    }

    /// Apply a route's condition and transform to a result. Returns the
    /// payload to forward, or `None` when the route does not fire.
    fn evaluate_route(
        &self,
        route: &OutputRoute,
        behavior: &RouteBehavior,
        result: &Value,
    ) -> Option<Value> {
        if let Some(condition) = &behavior.condition {
            match condition(result) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    warn!(route_id = %route.id, error = %e, "route condition failed, skipping route");
                    return None;
                }
            }
        }
        match &behavior.transform {
            Some(transform) => match transform(result) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(route_id = %route.id, error = %e, "route transform failed, skipping route");
                    None
                }
            },
            None => Some(result.clone()),
        }
    }

    /// Aggregate, read-only view across all positions. Never waits on
    /// in-flight work.
    pub async fn get_status(&self) -> WaggleResult<OrchestratorStatus> {
        let positions = self.manager.list_positions().await?;
        let pending_tasks = positions.iter().map(Position::pending_count).sum();
        let snapshots = positions
            .into_iter()
            .map(|p| PositionSnapshot {
                id: p.id,
                status: p.status,
                current_task_id: p.current_task_id,
            })
            .collect();
        Ok(OrchestratorStatus {
            positions: snapshots,
            pending_tasks,
            completed_tasks: self.completed_tasks.load(Ordering::SeqCst),
            total_cost_usd: *self.total_cost_usd.lock(),
        })
    }

    // ----- thin delegates: the public surface external callers should use -----

    pub async fn create_position(
        &self,
        template_name: &str,
        id: Option<String>,
        config: Option<Value>,
    ) -> WaggleResult<Position> {
        self.manager.create_position(template_name, id, config).await
    }

    /// Delete a position. In-flight executions for it must be cancelled by
    /// the caller first.
    pub async fn destroy_position(&self, id: &str) -> WaggleResult<()> {
        if self.inflight.lock().contains_key(id) {
            warn!(position_id = id, "destroying position with an in-flight execution");
        }
        self.manager.destroy_position(id).await
    }

    pub async fn get_position(&self, id: &str) -> WaggleResult<Option<Position>> {
        self.manager.get_position(id).await
    }

    pub async fn list_positions(&self) -> WaggleResult<Vec<Position>> {
        self.manager.list_positions().await
    }

    pub async fn add_output_route(
        &self,
        position_id: &str,
        task_type: &str,
        target_position_id: &str,
        behavior: RouteBehavior,
    ) -> WaggleResult<OutputRoute> {
        self.manager
            .add_output_route(position_id, task_type, target_position_id, behavior)
            .await
    }
}
