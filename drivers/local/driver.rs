use std::fs::Metadata;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{DriveError, Result};
use crate::storage::ops::require_file_not_exists;
use crate::storage::{
    BoxReader, ByteSource, ContentUrl, CopyOutcome, Drive, DriveId, DriveMeta, DriveRef, Entry,
    EntryMeta, UploadConfig, UploadParams,
};
use crate::task::TaskCtx;
use crate::utils::{clean_path, is_root_path, is_sub_path, millis, path_join};

const COPY_BUFFER: usize = 64 * 1024;

/// Local disk drive / 本地磁盘驱动
///
/// Every path is cleaned before it is joined to the root, so `..` can never
/// leave the mount directory.
pub struct LocalDrive {
    id: DriveId,
    this: Weak<LocalDrive>,
    root: PathBuf,
    disposed: AtomicBool,
}

fn map_io(err: std::io::Error, path: &str) -> DriveError {
    match err.kind() {
        std::io::ErrorKind::NotFound => DriveError::not_found(path),
        std::io::ErrorKind::AlreadyExists => DriveError::already_exists(path),
        _ => DriveError::Io(err),
    }
}

impl LocalDrive {
    pub fn new(root: PathBuf) -> Arc<Self> {
        let id = DriveId::next();
        Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            root,
            disposed: AtomicBool::new(false),
        })
    }

    /// Get root directory / 获取根目录
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn drive_ref(&self) -> DriveRef {
        let handle: Weak<dyn Drive> = self.this.clone();
        DriveRef::new(self.id, handle)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DriveError::Disposed);
        }
        Ok(())
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = clean_path(path);
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn entry_from(&self, path: &str, meta: &Metadata) -> Entry {
        if meta.is_dir() {
            Entry::dir(self.drive_ref(), path, EntryMeta::default())
        } else {
            let mod_time = meta
                .modified()
                .map(|t| millis(t.into()))
                .unwrap_or_default();
            Entry::file(self.drive_ref(), path, meta.len() as i64, mod_time, EntryMeta::default())
        }
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        let meta = fs::metadata(&full).await.map_err(|e| map_io(e, path))?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn ensure_parent(&self, path: &str) -> Result<()> {
        if let Some(parent) = self.full_path(path).parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// Stream the body into the file, advancing progress per chunk / 写入文件并更新进度
async fn write_body(ctx: &dyn TaskCtx, reader: &mut BoxReader, file: &mut fs::File) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut written = 0u64;
    loop {
        ctx.check()?;
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        ctx.progress(n as i64, false);
        written += n as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[async_trait]
impl Drive for LocalDrive {
    fn id(&self) -> DriveId {
        self.id
    }

    fn meta(&self) -> DriveMeta {
        DriveMeta { can_write: true }
    }

    async fn get(&self, path: &str) -> Result<Entry> {
        self.ensure_alive()?;
        let path = clean_path(path);
        if is_root_path(&path) {
            return Ok(Entry::dir(self.drive_ref(), "", EntryMeta::default()));
        }
        let meta = fs::metadata(self.full_path(&path))
            .await
            .map_err(|e| map_io(e, &path))?;
        Ok(self.entry_from(&path, &meta))
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        self.ensure_alive()?;
        let path = clean_path(path);
        let mut dir = fs::read_dir(self.full_path(&path))
            .await
            .map_err(|e| map_io(e, &path))?;
        let mut result = Vec::new();
        while let Some(child) = dir.next_entry().await? {
            let meta = child.metadata().await?;
            let name = child.file_name().to_string_lossy().to_string();
            result.push(self.entry_from(&path_join(&path, &name), &meta));
        }
        Ok(result)
    }

    async fn save(
        &self,
        ctx: &dyn TaskCtx,
        path: &str,
        _size: i64,
        overwrite: bool,
        body: ByteSource,
    ) -> Result<Entry> {
        self.ensure_alive()?;
        let path = clean_path(path);
        if is_root_path(&path) {
            return Err(DriveError::NotAllowed("cannot write to root".into()));
        }
        if !overwrite {
            require_file_not_exists(self, &path).await?;
        }

        let mut reader: BoxReader = match body {
            ByteSource::Seekable(r) => Box::new(r),
            ByteSource::Stream(r) => r,
        };
        self.ensure_parent(&path).await?;
        let full = self.full_path(&path);
        let mut file = fs::File::create(&full).await?;
        match write_body(ctx, &mut reader, &mut file).await {
            Ok(written) => tracing::debug!("Local save: {} ({} bytes)", path, written),
            Err(e) => {
                drop(file);
                // 写入失败时删除不完整的文件
                let _ = fs::remove_file(&full).await;
                return Err(e);
            }
        }
        self.get(&path).await
    }

    async fn make_dir(&self, path: &str) -> Result<Entry> {
        self.ensure_alive()?;
        let path = clean_path(path);
        match self.get(&path).await {
            Ok(entry) if entry.is_dir() => return Ok(entry),
            Ok(_) => return Err(DriveError::NotAllowed(format!("{} is a file", path))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(self.full_path(&path)).await?;
        self.get(&path).await
    }

    async fn copy(&self, ctx: &dyn TaskCtx, from: &Entry, to: &str, overwrite: bool) -> Result<CopyOutcome> {
        self.ensure_alive()?;
        if from.drive_id() != self.id {
            return Err(DriveError::unsupported("native copy across drive instances"));
        }
        if from.is_dir() {
            return Err(DriveError::unsupported("native copy of a directory"));
        }
        let to = clean_path(to);
        if is_root_path(&to) {
            return Err(DriveError::NotAllowed("cannot write to root".into()));
        }
        if !overwrite {
            match self.get(&to).await {
                Ok(existing) => return Ok(CopyOutcome::Skipped(existing)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        ctx.check()?;
        ctx.total(from.size(), false);
        self.ensure_parent(&to).await?;
        fs::copy(self.full_path(from.path()), self.full_path(&to))
            .await
            .map_err(|e| map_io(e, from.path()))?;
        ctx.progress(from.size(), false);
        Ok(CopyOutcome::Written(self.get(&to).await?))
    }

    async fn move_entry(&self, ctx: &dyn TaskCtx, from: &Entry, to: &str, overwrite: bool) -> Result<CopyOutcome> {
        self.ensure_alive()?;
        if from.drive_id() != self.id {
            return Err(DriveError::unsupported("native move across drive instances"));
        }
        let to = clean_path(to);
        if is_root_path(&to) || is_root_path(from.path()) {
            return Err(DriveError::NotAllowed("cannot move the root".into()));
        }
        if is_sub_path(from.path(), &to) {
            return Err(DriveError::NotAllowed(format!(
                "cannot move {} into itself",
                from.path()
            )));
        }
        // 目标不能是源的上级目录
        if is_sub_path(&to, from.path()) {
            return Err(DriveError::NotAllowed(format!(
                "cannot move {} onto its ancestor {}",
                from.path(),
                to
            )));
        }
        match self.get(&to).await {
            Ok(existing) if !overwrite => return Ok(CopyOutcome::Skipped(existing)),
            Ok(_) => self.remove(&to).await?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        ctx.check()?;
        if !from.is_dir() {
            ctx.total(from.size(), false);
        }
        self.ensure_parent(&to).await?;
        fs::rename(self.full_path(from.path()), self.full_path(&to))
            .await
            .map_err(|e| map_io(e, from.path()))?;
        if !from.is_dir() {
            ctx.progress(from.size(), false);
        }
        Ok(CopyOutcome::Written(self.get(&to).await?))
    }

    async fn delete(&self, ctx: &dyn TaskCtx, path: &str) -> Result<()> {
        self.ensure_alive()?;
        let path = clean_path(path);
        ctx.check()?;
        if !is_root_path(&path) {
            ctx.total(1, false);
            self.remove(&path).await?;
            ctx.progress(1, false);
            return Ok(());
        }
        // 根目录本身保留，只删除其内容
        let children = self.list("").await?;
        ctx.total(children.len() as i64, false);
        for child in children {
            ctx.check()?;
            self.remove(child.path()).await?;
            ctx.progress(1, false);
        }
        Ok(())
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        params: &UploadParams,
    ) -> Result<Option<UploadConfig>> {
        self.ensure_alive()?;
        if !params.action().issues_plan() {
            return Ok(None);
        }
        if !overwrite {
            require_file_not_exists(self, &clean_path(path)).await?;
        }
        Ok(Some(UploadConfig::local_proxy(size)))
    }

    async fn open_reader(&self, entry: &Entry) -> Result<BoxReader> {
        self.ensure_alive()?;
        if entry.is_dir() {
            return Err(DriveError::NotAllowed(format!("{} is a directory", entry.path())));
        }
        let file = fs::File::open(self.full_path(entry.path()))
            .await
            .map_err(|e| map_io(e, entry.path()))?;
        Ok(Box::new(file))
    }

    async fn content_url(&self, _entry: &Entry) -> Result<Option<ContentUrl>> {
        Ok(None)
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::info!("Local drive disposed: {:?}", self.root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::UploadProvider;
    use crate::task::{DummyContext, TaskContext};

    fn seekable(data: &[u8]) -> ByteSource {
        ByteSource::Seekable(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    #[tokio::test]
    async fn test_save_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());
        let ctx = TaskContext::new();
        let saved = drive
            .save(&ctx, "a/b.txt", 5, false, seekable(b"hello"))
            .await
            .unwrap();
        assert_eq!(saved.path(), "a/b.txt");
        assert_eq!(saved.size(), 5);
        assert!(saved.mod_time() > 0);
        assert_eq!(ctx.current_progress(), 5);

        let listed = drive.list("a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], saved);
        assert!(drive.get("a").await.unwrap().is_dir());
        assert!(drive.get("nope").await.unwrap_err().is_not_found());

        let err = drive
            .save(&DummyContext, "a/b.txt", 1, false, seekable(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_paths_confined_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let drive = LocalDrive::new(root.clone());
        drive
            .save(&DummyContext, "../../escape.txt", 1, false, seekable(b"x"))
            .await
            .unwrap();
        assert!(root.join("escape.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_cancelled_save_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());
        let ctx = TaskContext::new();
        ctx.cancel();
        let err = drive
            .save(&ctx, "f.txt", 1, false, seekable(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::Cancelled));
        assert!(!dir.path().join("f.txt").exists());
    }

    #[tokio::test]
    async fn test_native_copy_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "abc").unwrap();
        std::fs::write(dir.path().join("b.txt"), "old").unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());
        let from = drive.get("a.txt").await.unwrap();

        let out = drive.copy(&DummyContext, &from, "b.txt", false).await.unwrap();
        assert!(out.is_skipped());
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "old");

        let ctx = TaskContext::new();
        let out = drive.copy(&ctx, &from, "c/a.txt", false).await.unwrap();
        assert!(!out.is_skipped());
        assert_eq!(std::fs::read_to_string(dir.path().join("c/a.txt")).unwrap(), "abc");
        assert_eq!(ctx.current_progress(), 3);

        let d = drive.get("c").await.unwrap();
        assert!(drive.copy(&DummyContext, &d, "e", false).await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn test_native_move() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d/s")).unwrap();
        std::fs::write(dir.path().join("d/s/x.txt"), "x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "k").unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());

        let from = drive.get("d").await.unwrap();
        let out = drive.move_entry(&DummyContext, &from, "m/d2", false).await.unwrap();
        assert!(out.entry().is_dir());
        assert!(dir.path().join("m/d2/s/x.txt").exists());
        assert!(!dir.path().join("d").exists());

        let from = drive.get("m/d2/s/x.txt").await.unwrap();
        let out = drive.move_entry(&DummyContext, &from, "keep.txt", false).await.unwrap();
        assert!(out.is_skipped());
        assert!(dir.path().join("m/d2/s/x.txt").exists());

        let from = drive.get("m").await.unwrap();
        assert!(matches!(
            drive.move_entry(&DummyContext, &from, "m/inner", false).await,
            Err(DriveError::NotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_move_onto_ancestor_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a/other.txt"), "o").unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());

        let from = drive.get("a/b.txt").await.unwrap();
        assert!(matches!(
            drive.move_entry(&DummyContext, &from, "a", true).await,
            Err(DriveError::NotAllowed(_))
        ));
        assert!(dir.path().join("a/b.txt").exists());
        assert!(dir.path().join("a/other.txt").exists());
    }

    #[tokio::test]
    async fn test_root_is_synthetic_dir() {
        let dir = tempfile::tempdir().unwrap();
        let drive = LocalDrive::new(dir.path().join("missing"));
        let root = drive.get("").await.unwrap();
        assert!(root.is_dir());
        assert_eq!(root.path(), "");
        assert_eq!(root.size(), -1);
        assert!(drive.get("/").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("d/s")).unwrap();
        std::fs::write(dir.path().join("d/s/x.txt"), "x").unwrap();
        std::fs::write(dir.path().join("top.txt"), "t").unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());

        drive.delete(&DummyContext, "d").await.unwrap();
        assert!(!dir.path().join("d").exists());
        assert!(drive.delete(&DummyContext, "d").await.unwrap_err().is_not_found());

        let ctx = TaskContext::new();
        drive.delete(&ctx, "").await.unwrap();
        assert!(dir.path().exists());
        assert!(drive.list("").await.unwrap().is_empty());
        assert_eq!(ctx.current_progress(), 1);
    }

    #[tokio::test]
    async fn test_upload_is_always_local_proxy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "abc").unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());

        let plan = drive
            .upload("big.bin", 1 << 30, false, &UploadParams::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.provider, UploadProvider::LocalProxy);
        assert_eq!(plan.size, Some(1 << 30));

        let err = drive
            .upload("a.txt", 3, false, &UploadParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::AlreadyExists(_)));

        let done: UploadParams = serde_json::from_str(r#"{"action":"CompletePutObject"}"#).unwrap();
        assert!(drive.upload("a.txt", 3, false, &done).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_and_dispose() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "abc").unwrap();
        let drive = LocalDrive::new(dir.path().to_path_buf());
        let entry = drive.get("a.txt").await.unwrap();

        let mut out = String::new();
        entry.reader().await.unwrap().read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
        assert!(entry.url().await.unwrap().is_none());

        drive.dispose().await;
        assert!(matches!(drive.get("a.txt").await, Err(DriveError::Disposed)));
    }
}
