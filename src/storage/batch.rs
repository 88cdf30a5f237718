//! Batched submission for recursive deletes / 批量删除
//!
//! Batches go out one at a time. Cancellation is checked before each one,
//! the first failing batch aborts the run, and batches already submitted
//! stay applied.

use std::future::Future;

use crate::error::Result;
use crate::task::TaskCtx;

/// Most object stores cap a bulk delete at 1000 keys / 单批最大数量
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Submit `items` in chunks of at most `batch_size`, advancing progress by
/// the chunk length after each success / 分批提交
pub async fn delete_in_batches<T, F, Fut>(
    ctx: &dyn TaskCtx,
    items: Vec<T>,
    batch_size: usize,
    mut submit: F,
) -> Result<()>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let batch_size = batch_size.max(1);
    let mut items = items.into_iter().peekable();
    let mut index = 0usize;

    while items.peek().is_some() {
        ctx.check()?;
        let batch: Vec<T> = items.by_ref().take(batch_size).collect();
        let len = batch.len() as i64;
        tracing::debug!("submitting delete batch #{} ({} items)", index, len);
        submit(batch).await?;
        ctx.progress(len, false);
        index += 1;
    }
    Ok(())
}
