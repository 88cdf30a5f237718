use std::sync::atomic::{AtomicI64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::{DriveError, Result};

/// Progress/cancellation handle threaded through long operations / 任务上下文
///
/// `progress` and `total` only ever grow: a delta below zero is ignored and a
/// set (`is_set = true`) never moves a counter backwards.
pub trait TaskCtx: Send + Sync {
    /// Advance (or set) the progress counter / 更新进度
    fn progress(&self, value: i64, is_set: bool);

    /// Advance (or set) the total counter / 更新总量
    fn total(&self, value: i64, is_set: bool);

    fn is_cancelled(&self) -> bool;

    /// Fail with `Cancelled` once the task has been cancelled / 检查取消
    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DriveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn bump(counter: &AtomicI64, value: i64, is_set: bool) {
    if is_set {
        counter.fetch_max(value, Ordering::AcqRel);
    } else if value > 0 {
        counter.fetch_add(value, Ordering::AcqRel);
    }
}

/// Task context backed by atomics and a cancellation token / 任务上下文实现
#[derive(Debug, Default)]
pub struct TaskContext {
    progress: AtomicI64,
    total: AtomicI64,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child context cancelled together with `parent` / 随父令牌一同取消
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            ..Self::default()
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn current_progress(&self) -> i64 {
        self.progress.load(Ordering::Acquire)
    }

    pub fn current_total(&self) -> i64 {
        self.total.load(Ordering::Acquire)
    }

    /// Resolves once the task is cancelled / 取消时完成
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl TaskCtx for TaskContext {
    fn progress(&self, value: i64, is_set: bool) {
        bump(&self.progress, value, is_set);
    }

    fn total(&self, value: i64, is_set: bool) {
        bump(&self.total, value, is_set);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Context that records nothing and is never cancelled / 空上下文
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyContext;

impl TaskCtx for DummyContext {
    fn progress(&self, _value: i64, _is_set: bool) {}

    fn total(&self, _value: i64, _is_set: bool) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_never_decrease() {
        let ctx = TaskContext::new();
        ctx.progress(10, false);
        ctx.progress(-5, false);
        assert_eq!(ctx.current_progress(), 10);
        ctx.progress(4, true);
        assert_eq!(ctx.current_progress(), 10);
        ctx.progress(25, true);
        assert_eq!(ctx.current_progress(), 25);

        ctx.total(100, true);
        ctx.total(1, false);
        assert_eq!(ctx.current_total(), 101);
    }

    #[test]
    fn test_cancel() {
        let ctx = TaskContext::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(DriveError::Cancelled)));
        assert!(!DummyContext.is_cancelled());
    }

    #[test]
    fn test_parent_cancellation() {
        let parent = CancellationToken::new();
        let ctx = TaskContext::with_parent(&parent);
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_progress() {
        let ctx = Arc::new(TaskContext::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    ctx.progress(1, false);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ctx.current_progress(), 8000);
    }
}
