//! Registry of background tasks and the node health derived from them.
//!
//! The expiration sweeper and the admission sampler register here when they
//! start and report every state change. The admin `/status` endpoint reads
//! [`BgTaskSupervisor::snapshot`]. A failed **critical** task marks the node
//! `DEGRADED`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCriticality {
    /// Invariants degrade without it (expired codes stop being reclaimed).
    Critical,
    /// Stale data is tolerable for a while (memory sampling).
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Starting => "STARTING",
            TaskState::Running => "RUNNING",
            TaskState::Failed => "FAILED",
            TaskState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    Healthy,
    Degraded,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Healthy => f.write_str("HEALTHY"),
            NodeHealth::Degraded => f.write_str("DEGRADED"),
        }
    }
}

#[derive(Debug, Clone)]
struct TaskEntry {
    role: String,
    criticality: TaskCriticality,
    state: TaskState,
    since: Instant,
    ticks: u64,
    last_tick: Option<Instant>,
    failure_reason: Option<String>,
}

/// Point-in-time view of one task, ages in whole seconds.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub role: String,
    pub criticality: TaskCriticality,
    pub state: TaskState,
    pub state_age_secs: u64,
    pub ticks: u64,
    pub last_tick_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorSnapshot {
    pub node_health: NodeHealth,
    pub critical_failures: usize,
    pub total_registered: u64,
    pub tasks: Vec<TaskStatus>,
}

pub struct BgTaskSupervisor {
    tasks: RwLock<HashMap<String, TaskEntry>>,
    total_registered: AtomicU64,
}

impl BgTaskSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            total_registered: AtomicU64::new(0),
        }
    }

    /// Register (or re-register) a task in `Starting` state.
    pub fn register(&self, name: &str, role: &str, criticality: TaskCriticality) {
        let entry = TaskEntry {
            role: role.to_string(),
            criticality,
            state: TaskState::Starting,
            since: Instant::now(),
            ticks: 0,
            last_tick: None,
            failure_reason: None,
        };
        self.tasks.write().insert(name.to_string(), entry);
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(task = name, role, ?criticality, "background task registered");
    }

    pub fn report_running(&self, name: &str) {
        self.transition(name, TaskState::Running);
    }

    /// Record one completed iteration of the task loop.
    pub fn report_tick(&self, name: &str) {
        if let Some(entry) = self.tasks.write().get_mut(name) {
            entry.ticks += 1;
            entry.last_tick = Some(Instant::now());
        }
    }

    pub fn report_failed(&self, name: &str, reason: &str) {
        let mut tasks = self.tasks.write();
        let Some(entry) = tasks.get_mut(name) else {
            return;
        };
        let previous = entry.state;
        entry.state = TaskState::Failed;
        entry.since = Instant::now();
        entry.failure_reason = Some(reason.to_string());
        match entry.criticality {
            TaskCriticality::Critical => tracing::error!(
                task = name,
                role = %entry.role,
                previous_state = %previous,
                reason,
                "critical background task failed, node degraded"
            ),
            TaskCriticality::BestEffort => tracing::warn!(
                task = name,
                role = %entry.role,
                reason,
                "best-effort background task failed"
            ),
        }
    }

    pub fn report_stopped(&self, name: &str) {
        self.transition(name, TaskState::Stopped);
    }

    pub fn unregister(&self, name: &str) {
        self.tasks.write().remove(name);
    }

    fn transition(&self, name: &str, state: TaskState) {
        if let Some(entry) = self.tasks.write().get_mut(name) {
            entry.state = state;
            entry.since = Instant::now();
            entry.failure_reason = None;
        }
    }

    pub fn node_health(&self) -> NodeHealth {
        let degraded = self
            .tasks
            .read()
            .values()
            .any(|e| e.criticality == TaskCriticality::Critical && e.state == TaskState::Failed);
        if degraded {
            NodeHealth::Degraded
        } else {
            NodeHealth::Healthy
        }
    }

    pub fn task_state(&self, name: &str) -> Option<TaskState> {
        self.tasks.read().get(name).map(|e| e.state)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Tasks sorted by name, for stable output.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        let tasks = self.tasks.read();
        let mut list: Vec<TaskStatus> = tasks
            .iter()
            .map(|(name, e)| TaskStatus {
                name: name.clone(),
                role: e.role.clone(),
                criticality: e.criticality,
                state: e.state,
                state_age_secs: e.since.elapsed().as_secs(),
                ticks: e.ticks,
                last_tick_age_secs: e.last_tick.map(|t| t.elapsed().as_secs()),
                failure_reason: e.failure_reason.clone(),
            })
            .collect();
        drop(tasks);
        list.sort_by(|a, b| a.name.cmp(&b.name));

        let critical_failures = list
            .iter()
            .filter(|t| t.criticality == TaskCriticality::Critical && t.state == TaskState::Failed)
            .count();
        SupervisorSnapshot {
            node_health: if critical_failures > 0 {
                NodeHealth::Degraded
            } else {
                NodeHealth::Healthy
            },
            critical_failures,
            total_registered: self.total_registered.load(Ordering::Relaxed),
            tasks: list,
        }
    }
}

impl Default for BgTaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
