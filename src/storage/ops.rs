//! Helpers shared by drives, and the cross-drive copy/move orchestrator
//! 驱动通用操作，以及跨驱动复制/移动

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};

use super::{ByteSource, CopyOutcome, Drive, Entry, ReadSeek};
use crate::error::{DriveError, Result};
use crate::task::{DummyContext, TaskCtx};
use crate::utils::{clean_path, is_sub_path, path_join};

/// Fail with `AlreadyExists` if anything lives at `path` / 确认目标不存在
pub async fn require_file_not_exists(drive: &dyn Drive, path: &str) -> Result<()> {
    match drive.get(path).await {
        Ok(_) => Err(DriveError::already_exists(path)),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Materialized subtree / 子树
#[derive(Debug, Clone)]
pub struct EntryNode {
    pub entry: Entry,
    pub children: Vec<EntryNode>,
}

/// Walk the subtree rooted at `entry`, listing through its own drive
/// 构建条目树
pub fn build_entries_tree<'a>(
    ctx: &'a dyn TaskCtx,
    entry: &'a Entry,
) -> BoxFuture<'a, Result<EntryNode>> {
    async move {
        ctx.check()?;
        let mut node = EntryNode {
            entry: entry.clone(),
            children: Vec::new(),
        };
        if entry.is_dir() {
            let drive = entry.drive()?;
            for child in drive.list(entry.path()).await? {
                node.children.push(build_entries_tree(ctx, &child).await?);
            }
        }
        Ok(node)
    }
    .boxed()
}

/// Pre-order flattening, parents before children / 展开条目树
pub fn flatten_entries_tree(root: EntryNode) -> Vec<Entry> {
    let mut result = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        result.push(node.entry);
        stack.extend(node.children.into_iter().rev());
    }
    result
}

/// Copy a one-shot stream into an anonymous temp file and rewind it
/// 将流写入临时文件，文件句柄释放后由系统删除
pub async fn spool_to_temp_file<R>(
    ctx: &dyn TaskCtx,
    reader: &mut R,
    temp_dir: &Path,
) -> Result<tokio::fs::File>
where
    R: AsyncRead + Unpin + Send + ?Sized,
{
    ctx.check()?;
    let dir = temp_dir.to_path_buf();
    let std_file = tokio::task::spawn_blocking(move || tempfile::tempfile_in(dir))
        .await
        .map_err(|e| DriveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    let mut file = tokio::fs::File::from_std(std_file);
    let written = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.seek(SeekFrom::Start(0)).await?;
    tracing::debug!("spooled {} bytes to temp file", written);
    Ok(file)
}

/// Turn any body into something whose length is known / 获取可寻址内容
pub async fn into_seekable(
    ctx: &dyn TaskCtx,
    body: ByteSource,
    temp_dir: &Path,
) -> Result<Box<dyn ReadSeek>> {
    match body {
        ByteSource::Seekable(r) => Ok(r),
        ByteSource::Stream(mut r) => {
            let file = spool_to_temp_file(ctx, &mut r, temp_dir).await?;
            Ok(Box::new(file))
        }
    }
}

/// Length of a seekable body, leaving it rewound / 获取长度
pub async fn seekable_len(body: &mut Box<dyn ReadSeek>) -> Result<u64> {
    let len = body.seek(SeekFrom::End(0)).await?;
    body.seek(SeekFrom::Start(0)).await?;
    Ok(len)
}

/// Same-drive copies and moves may not nest source and target / 源与目标不能互相包含
fn check_not_nested(from: &Entry, to_drive: &dyn Drive, to: &str) -> Result<()> {
    if from.drive_id() != to_drive.id() {
        return Ok(());
    }
    let to = clean_path(to);
    if is_sub_path(from.path(), &to) || is_sub_path(&to, from.path()) {
        return Err(DriveError::NotAllowed(format!(
            "cannot copy {} to {}: paths overlap",
            from.path(),
            to
        )));
    }
    Ok(())
}

/// Copy `from` to `to` on `to_drive` / 复制条目
///
/// Native copy is attempted only when both sides are the same drive
/// instance; otherwise (or when the drive answers `Unsupported`) the
/// content is streamed through the gateway.
pub async fn copy_entry(
    ctx: &dyn TaskCtx,
    from: &Entry,
    to_drive: &Arc<dyn Drive>,
    to: &str,
    overwrite: bool,
) -> Result<CopyOutcome> {
    check_not_nested(from, to_drive.as_ref(), to)?;
    if from.drive_id() == to_drive.id() {
        match to_drive.copy(ctx, from, to, overwrite).await {
            Err(e) if e.is_unsupported() => {}
            result => return result,
        }
    }
    stream_copy(ctx, from, to_drive.as_ref(), to, overwrite).await
}

/// Move `from` to `to` on `to_drive` / 移动条目
///
/// The source is only deleted when the copy actually wrote something.
pub async fn move_entry(
    ctx: &dyn TaskCtx,
    from: &Entry,
    to_drive: &Arc<dyn Drive>,
    to: &str,
    overwrite: bool,
) -> Result<CopyOutcome> {
    check_not_nested(from, to_drive.as_ref(), to)?;
    if from.drive_id() == to_drive.id() {
        match to_drive.move_entry(ctx, from, to, overwrite).await {
            Err(e) if e.is_unsupported() => {}
            result => return result,
        }
    }
    let outcome = copy_entry(ctx, from, to_drive, to, overwrite).await?;
    if !outcome.is_skipped() {
        from.drive()?.delete(&DummyContext, from.path()).await?;
    }
    Ok(outcome)
}

/// Read-then-write copy. A directory counts as skipped when any of its
/// descendants was skipped, so a move keeps the source subtree.
fn stream_copy<'a>(
    ctx: &'a dyn TaskCtx,
    from: &'a Entry,
    to_drive: &'a dyn Drive,
    to: &'a str,
    overwrite: bool,
) -> BoxFuture<'a, Result<CopyOutcome>> {
    async move {
        ctx.check()?;
        if from.is_dir() {
            let dir = to_drive.make_dir(to).await?;
            let children = from.drive()?.list(from.path()).await?;
            let mut skipped = false;
            for child in &children {
                let target = path_join(to, &child.name());
                let outcome = stream_copy(ctx, child, to_drive, &target, overwrite).await?;
                skipped |= outcome.is_skipped();
            }
            return Ok(if skipped {
                CopyOutcome::Skipped(dir)
            } else {
                CopyOutcome::Written(dir)
            });
        }

        if !overwrite {
            match to_drive.get(to).await {
                Ok(existing) => return Ok(CopyOutcome::Skipped(existing)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        ctx.total(from.size(), false);
        let reader = from.reader().await?;
        let entry = to_drive
            .save(ctx, to, from.size(), overwrite, ByteSource::Stream(reader))
            .await?;
        Ok(CopyOutcome::Written(entry))
    }
    .boxed()
}
