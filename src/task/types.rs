use serde::{Deserialize, Serialize};

use super::models::TaskSummary;

/// Long-running drive operations / 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Upload,
    Copy,
    Move,
    Delete,
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待并发名额
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 任务生命周期事件，结束时的结果看 `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "task", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted(TaskSummary),
    Started(TaskSummary),
    Finished(TaskSummary),
}

impl TaskEvent {
    pub fn summary(&self) -> &TaskSummary {
        match self {
            Self::Submitted(s) | Self::Started(s) | Self::Finished(s) => s,
        }
    }
}
