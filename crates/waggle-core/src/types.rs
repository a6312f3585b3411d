use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Well-known event type strings used by the orchestration core.
pub mod event_types {
    /// Prefix shared by all inter-position task events.
    pub const TASK_PREFIX: &str = "task.";
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
}

/// Lifecycle status of a position (a durable worker slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Idle,
    Busy,
    Error,
    Stopped,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Idle => write!(f, "idle"),
            PositionStatus::Busy => write!(f, "busy"),
            PositionStatus::Error => write!(f, "error"),
            PositionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Status of a task in a position's queue.
///
/// `Done` and `Failed` are terminal; a task never leaves either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// Priority band for queued tasks. Ordering: critical > high > normal > low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric rank used for queue ordering. The exact integers are
    /// implementation-internal and never serialized.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }
}

/// A unit of work routed between positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub source_position_id: String,
    pub target_position_id: String,
    /// Free-form task type, matched against output-route patterns.
    pub task_type: String,
    /// Opaque payload; the core never interprets it.
    pub payload: Value,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Set on completion; holds the error message on failure.
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_position_id: spec.source_position_id,
            target_position_id: spec.target_position_id,
            task_type: spec.task_type,
            payload: spec.payload,
            priority: spec.priority,
            status: TaskStatus::Pending,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Caller-supplied description of a task to dispatch. The manager assigns
/// the id, status, and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub source_position_id: String,
    pub target_position_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl TaskSpec {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            source_position_id: source.into(),
            target_position_id: target.into(),
            task_type: task_type.into(),
            payload: Value::Null,
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Durable definition of a forwarding rule owned by a position.
///
/// Condition and transform closures are behavior, not data: they are never
/// serialized. Only the `has_condition` / `has_transform` flags survive a
/// restart; closures must be re-registered against the route id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRoute {
    pub id: Uuid,
    /// Pattern over task types: `*` matches everything, a trailing `*`
    /// matches by prefix, anything else matches exactly.
    pub task_type: String,
    pub target_position_id: String,
    #[serde(default)]
    pub has_condition: bool,
    #[serde(default)]
    pub has_transform: bool,
}

impl OutputRoute {
    pub fn new(task_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            target_position_id: target.into(),
            has_condition: false,
            has_transform: false,
        }
    }
}

/// Match a route pattern against a task type.
pub fn route_pattern_matches(pattern: &str, task_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return task_type.starts_with(prefix);
    }
    pattern == task_type
}

/// A named, durable worker slot that owns a task queue and routing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    /// Name of the role template this position was created from.
    pub template_name: String,
    pub status: PositionStatus,
    pub task_queue: Vec<Task>,
    pub current_task_id: Option<Uuid>,
    pub output_routes: Vec<OutputRoute>,
    /// Optional per-position override of template fields.
    #[serde(default)]
    pub config: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn new(id: impl Into<String>, template_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            template_name: template_name.into(),
            status: PositionStatus::Idle,
            task_queue: Vec::new(),
            current_task_id: None,
            output_routes: Vec::new(),
            config: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Number of tasks still waiting to run.
    pub fn pending_count(&self) -> usize {
        self.task_queue
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }
}

/// A named worker template: the program a position runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Per-template execution timeout; overrides the orchestrator default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_turns() -> u32 {
    20
}

/// An immutable fact describing something that happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Convention: `<domain>.<verb>`; task events are prefixed `task.`.
    pub event_type: String,
    pub source_position_id: String,
    pub target_position_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        target: Option<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source_position_id: source.into(),
            target_position_id: target,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Filter for historical event queries. All set fields are ANDed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub source_position_id: Option<String>,
    pub target_position_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the last N matching events.
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Whether an event passes every set field (ignores `limit`).
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(t) = &self.event_type {
            if &event.event_type != t {
                return false;
            }
        }
        if let Some(s) = &self.source_position_id {
            if &event.source_position_id != s {
                return false;
            }
        }
        if let Some(t) = &self.target_position_id {
            if event.target_position_id.as_ref() != Some(t) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}
