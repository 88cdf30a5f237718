use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::TaskContext;
use super::types::{TaskStatus, TaskType};

/// 轻量级任务信息（用于事件推送）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub name: String,
    pub source_path: String,
    pub target_path: Option<String>,
    pub total: i64,
    pub processed: i64,
    pub progress: f32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskSummary {
    /// 合并任务上下文中的实时进度
    pub fn new(task: &Task, ctx: Option<&TaskContext>) -> Self {
        let (total, processed) = match ctx {
            Some(ctx) => (ctx.current_total(), ctx.current_progress()),
            None => (task.total, task.processed),
        };
        let progress = if total > 0 {
            (processed as f32 / total as f32 * 100.0).min(100.0)
        } else if task.status == TaskStatus::Completed {
            100.0
        } else {
            0.0
        };
        Self {
            id: task.id.clone(),
            task_type: task.task_type,
            status: task.status,
            name: task.name.clone(),
            source_path: task.source_path.clone(),
            target_path: task.target_path.clone(),
            total,
            processed,
            progress,
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            error: task.error.clone(),
        }
    }
}

/// 任务信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub name: String,
    pub source_path: String,
    pub target_path: Option<String>,
    pub total: i64,     // 结束时的总量快照
    pub processed: i64, // 结束时的进度快照
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        name: String,
        source_path: String,
        target_path: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            status: TaskStatus::Pending,
            name,
            source_path,
            target_path,
            total: 0,
            processed: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// 标记结束并记录进度快照
    pub fn finish(&mut self, status: TaskStatus, ctx: &TaskContext, error: Option<String>) {
        self.status = status;
        self.total = ctx.current_total();
        self.processed = ctx.current_progress();
        self.finished_at = Some(Utc::now());
        self.error = error;
    }
}
