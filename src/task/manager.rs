use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::context::TaskContext;
use super::models::{Task, TaskSummary};
use super::types::{TaskEvent, TaskStatus, TaskType};
use crate::error::{DriveError, Result};

/// 任务管理器（限制并发，支持事件广播）
#[derive(Clone)]
pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    contexts: Arc<RwLock<HashMap<String, Arc<TaskContext>>>>,
    handles: Arc<parking_lot::Mutex<HashMap<String, JoinHandle<()>>>>,
    limiter: Arc<Semaphore>,
    event_sender: broadcast::Sender<TaskEvent>,
    /// 所有任务上下文的父令牌
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(max_concurrent: usize) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            contexts: Arc::new(RwLock::new(HashMap::new())),
            handles: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            event_sender,
            shutdown: CancellationToken::new(),
        }
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_sender.subscribe()
    }

    /// 广播事件
    fn broadcast(&self, event: TaskEvent) {
        let _ = self.event_sender.send(event);
    }

    /// 提交任务，返回任务ID
    pub async fn submit<F, Fut>(
        &self,
        task_type: TaskType,
        name: String,
        source_path: String,
        target_path: Option<String>,
        run: F,
    ) -> String
    where
        F: FnOnce(Arc<TaskContext>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task = Task::new(task_type, name, source_path, target_path);
        let id = task.id.clone();
        let ctx = Arc::new(TaskContext::with_parent(&self.shutdown));

        self.tasks.write().await.insert(id.clone(), task.clone());
        self.contexts.write().await.insert(id.clone(), ctx.clone());
        self.broadcast(TaskEvent::Submitted(TaskSummary::new(&task, Some(&ctx))));

        let manager = self.clone();
        let task_id = id.clone();
        // 持锁直到句柄登记完成，finish 中的移除不会早于插入
        let mut handles = self.handles.lock();
        let handle = tokio::spawn(async move {
            // 排队期间被取消则直接结束
            let permit = tokio::select! {
                biased;
                _ = ctx.cancelled() => None,
                permit = manager.limiter.clone().acquire_owned() => permit.ok(),
            };
            let result = match permit {
                Some(_permit) => {
                    manager.mark_running(&task_id).await;
                    run(ctx.clone()).await
                }
                None => Err(DriveError::Cancelled),
            };
            manager.finish(&task_id, &ctx, result).await;
        });
        handles.insert(id.clone(), handle);
        drop(handles);

        tracing::debug!("task {} submitted", id);
        id
    }

    async fn mark_running(&self, task_id: &str) {
        let summary = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(task_id) else { return };
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            TaskSummary::new(task, None)
        };
        self.broadcast(TaskEvent::Started(summary));
    }

    async fn finish(&self, task_id: &str, ctx: &TaskContext, result: Result<()>) {
        let (status, error) = match result {
            Ok(()) => (TaskStatus::Completed, None),
            Err(DriveError::Cancelled) => (TaskStatus::Cancelled, None),
            Err(e) => {
                tracing::warn!("task {} failed: {}", task_id, e);
                (TaskStatus::Failed, Some(e.to_string()))
            }
        };
        let summary = {
            let mut tasks = self.tasks.write().await;
            tasks.get_mut(task_id).map(|task| {
                task.finish(status, ctx, error);
                TaskSummary::new(task, None)
            })
        };
        self.contexts.write().await.remove(task_id);
        self.handles.lock().remove(task_id);
        let Some(summary) = summary else { return };
        tracing::debug!("task {} finished: {:?}", task_id, status);
        self.broadcast(TaskEvent::Finished(summary));
    }

    /// 获取任务（含实时进度）
    pub async fn get_task(&self, task_id: &str) -> Option<TaskSummary> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(task_id)?;
        let contexts = self.contexts.read().await;
        Some(TaskSummary::new(task, contexts.get(task_id).map(|c| c.as_ref())))
    }

    /// 获取所有任务
    pub async fn list_tasks(&self) -> Vec<TaskSummary> {
        let tasks = self.tasks.read().await;
        let contexts = self.contexts.read().await;
        let mut list: Vec<TaskSummary> = tasks
            .values()
            .map(|t| TaskSummary::new(t, contexts.get(&t.id).map(|c| c.as_ref())))
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// 取消任务
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        match self.contexts.read().await.get(task_id) {
            Some(ctx) => {
                ctx.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消所有未完成的任务（关闭时调用，之后提交的任务也会立即取消）
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// 等待任务结束
    pub async fn wait(&self, task_id: &str) -> Option<TaskSummary> {
        let handle = self.handles.lock().remove(task_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("task {} panicked: {}", task_id, e);
            }
        }
        self.get_task(task_id).await
    }

    /// 清除已完成的任务
    pub async fn clear_finished(&self) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !t.status.is_finished());
        self.handles.lock().retain(|id, _| tasks.contains_key(id));
        before - tasks.len()
    }
}

/// 记录任务事件直到通道关闭，返回记录的事件数
pub async fn log_task_events(mut events: broadcast::Receiver<TaskEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                let task = event.summary();
                tracing::debug!("Task {} ({:?}) is {:?}", task.id, task.task_type, task.status);
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Task event logger lagged, {} events skipped", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskCtx;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_completes_with_progress() {
        let manager = TaskManager::new(2);
        let id = manager
            .submit(TaskType::Copy, "copy".into(), "a".into(), Some("b".into()), |ctx| async move {
                ctx.total(10, true);
                ctx.progress(10, false);
                Ok(())
            })
            .await;
        let summary = manager.wait(&id).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(summary.total, 10);
        assert_eq!(summary.processed, 10);
        assert_eq!(summary.progress, 100.0);
    }

    #[tokio::test]
    async fn test_task_failure_and_cancel() {
        let manager = TaskManager::new(1);
        let failed = manager
            .submit(TaskType::Delete, "rm".into(), "x".into(), None, |_ctx| async {
                Err(DriveError::not_found("x"))
            })
            .await;
        let summary = manager.wait(&failed).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Failed);
        assert!(summary.error.unwrap().contains("not found"));

        let mut events = manager.subscribe();
        let slow = manager
            .submit(TaskType::Move, "mv".into(), "a".into(), None, |ctx| async move {
                loop {
                    ctx.check()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.cancel_task(&slow).await);
        let summary = manager.wait(&slow).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Cancelled);

        let mut saw_cancel = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, TaskEvent::Finished(s) if s.status == TaskStatus::Cancelled) {
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
        assert_eq!(manager.clear_finished().await, 2);
        assert!(manager.list_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_task_releases_handle() {
        let manager = TaskManager::new(2);
        let mut events = manager.subscribe();
        let id = manager
            .submit(TaskType::Copy, "cp".into(), "a".into(), None, |_ctx| async { Ok(()) })
            .await;
        loop {
            if let TaskEvent::Finished(s) = events.recv().await.unwrap() {
                assert_eq!(s.id, id);
                break;
            }
        }
        assert!(manager.handles.lock().is_empty());
        let summary = manager.wait(&id).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_event_logger_survives_lag() {
        let (sender, receiver) = broadcast::channel(1);
        let task = Task::new(TaskType::Copy, "cp".into(), "a".into(), None);
        for _ in 0..3 {
            sender.send(TaskEvent::Submitted(TaskSummary::new(&task, None))).unwrap();
        }
        drop(sender);
        assert_eq!(log_task_events(receiver).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let manager = TaskManager::new(1);
        let running = manager
            .submit(TaskType::Delete, "rm".into(), "a".into(), None, |ctx| async move {
                loop {
                    ctx.check()?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;
        // 排队中的任务
        let queued = manager
            .submit(TaskType::Copy, "cp".into(), "b".into(), None, |_ctx| async { Ok(()) })
            .await;
        manager.cancel_all();
        assert_eq!(manager.wait(&running).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(manager.wait(&queued).await.unwrap().status, TaskStatus::Cancelled);
    }
}
