//! S3驱动核心实现
//!
//! 目录用以 `/` 结尾的占位对象表示，根目录为虚拟目录。
//! 所有写操作之后清除对应路径及其父目录的缓存。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::client::{CompletedPart, ObjectStore};
use super::config::S3Config;
use super::upload::{UploadNegotiator, DOWNLOAD_URL_TTL};
use crate::error::{DriveError, Result};
use crate::storage::batch::{delete_in_batches, DEFAULT_BATCH_SIZE};
use crate::storage::ops::{
    build_entries_tree, flatten_entries_tree, into_seekable, require_file_not_exists, seekable_len,
};
use crate::storage::{
    create_cache, BoxReader, ByteSource, CacheRecord, ContentUrl, CopyOutcome, Drive, DriveCache,
    DriveId, DriveMeta, DriveRef, Entry, EntryBinder, EntryMeta, EntryType, ReadSeek, UploadConfig,
    UploadParams,
};
use crate::task::{DummyContext, TaskCtx};
use crate::utils::{clean_path, is_root_path, path_parent};

/// 超过该大小时网关自己分片上传
const SINGLE_PUT_LIMIT: u64 = 16 * 1024 * 1024;
/// 网关分片大小（S3最小5MB）
const PART_SIZE: usize = 8 * 1024 * 1024;

/// S3驱动
pub struct S3Drive {
    id: DriveId,
    this: Weak<S3Drive>,
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn DriveCache>,
    cache_ttl: Duration,
    negotiator: UploadNegotiator,
    proxy_download: bool,
    temp_dir: PathBuf,
    disposed: AtomicBool,
}

fn bind_record(drive: &DriveRef, record: &CacheRecord) -> Result<Entry> {
    // 驱动已释放时视为未命中
    drive.upgrade()?;
    Ok(match record.entry_type {
        EntryType::Dir => Entry::dir(drive.clone(), &record.path, EntryMeta::default()),
        EntryType::File => Entry::file(
            drive.clone(),
            &record.path,
            record.size,
            record.mod_time,
            EntryMeta::default(),
        ),
    })
}

impl S3Drive {
    pub fn new(store: Arc<dyn ObjectStore>, config: &S3Config, temp_dir: PathBuf) -> Arc<Self> {
        let id = DriveId::next();
        Arc::new_cyclic(|this: &Weak<S3Drive>| {
            let handle: Weak<dyn Drive> = this.clone();
            let drive_ref = DriveRef::new(id, handle);
            let binder: EntryBinder = Arc::new(move |record: &CacheRecord| bind_record(&drive_ref, record));
            Self {
                id,
                this: this.clone(),
                negotiator: UploadNegotiator::new(store.clone(), config.proxy_upload),
                store,
                cache: create_cache(config.cache_ttl, binder),
                cache_ttl: Duration::from_secs(config.cache_ttl.max(0) as u64),
                proxy_download: config.proxy_download,
                temp_dir,
                disposed: AtomicBool::new(false),
            }
        })
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

    fn file_entry(&self, path: &str, size: i64, mod_time: Option<i64>) -> Entry {
        Entry::file(
            self.drive_ref(),
            path,
            size,
            mod_time.unwrap_or_default(),
            EntryMeta::default(),
        )
    }

    fn dir_entry(&self, path: &str) -> Entry {
        Entry::dir(self.drive_ref(), path, EntryMeta::default())
    }

    fn evict_with_parent(&self, path: &str, recursive: bool) {
        self.cache.evict(path, recursive);
        self.cache.evict(&path_parent(path), false);
    }

    /// 单次 PutObject，内容整体读入内存
    async fn put_single(&self, ctx: &dyn TaskCtx, key: &str, body: &mut Box<dyn ReadSeek>, len: u64) -> Result<()> {
        ctx.check()?;
        let mut buf = Vec::with_capacity(len as usize);
        body.read_to_end(&mut buf).await?;
        tracing::debug!("S3 PutObject: key={}, size={}", key, buf.len());
        self.store.put_object(key, Bytes::from(buf)).await?;
        ctx.progress(len as i64, false);
        Ok(())
    }

    /// 网关分片上传，每片之前检查取消
    async fn put_multipart(&self, ctx: &dyn TaskCtx, key: &str, body: &mut Box<dyn ReadSeek>) -> Result<()> {
        let upload_id = self.store.create_multipart_upload(key).await?;
        tracing::debug!("S3 CreateMultipartUpload: key={}, upload_id={}", key, upload_id);

        let parts = match self.upload_parts(ctx, key, &upload_id, body).await {
            Ok(parts) => parts,
            Err(e) => {
                // 未完成的分片交给存储桶生命周期规则清理
                tracing::warn!(
                    "S3 multipart upload abandoned: key={}, upload_id={}, error={}",
                    key,
                    upload_id,
                    e
                );
                return Err(e);
            }
        };
        tracing::debug!("S3 CompleteMultipartUpload: key={}, parts={}", key, parts.len());
        self.store
            .complete_multipart_upload(key, &upload_id, &parts)
            .await
    }

    async fn upload_parts(
        &self,
        ctx: &dyn TaskCtx,
        key: &str,
        upload_id: &str,
        body: &mut Box<dyn ReadSeek>,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            ctx.check()?;
            let chunk = read_chunk(body, PART_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len() as i64;
            let etag = self.store.upload_part(key, upload_id, part_number, chunk).await?;
            parts.push(CompletedPart { part_number, etag });
            ctx.progress(len, false);
            part_number += 1;
        }
        Ok(parts)
    }

    async fn copy_file(&self, ctx: &dyn TaskCtx, from: &Entry, to: &str, overwrite: bool) -> Result<CopyOutcome> {
        if !overwrite {
            match self.get(to).await {
                Ok(existing) => return Ok(CopyOutcome::Skipped(existing)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        ctx.check()?;
        ctx.total(from.size(), false);
        tracing::debug!("S3 CopyObject: {} -> {}", from.path(), to);
        let result = self.store.copy_object(from.path(), to).await;
        self.evict_with_parent(to, true);
        result?;
        ctx.progress(from.size(), false);
        Ok(CopyOutcome::Written(self.get(to).await?))
    }

    /// 展开子树并分批删除，目录键带 `/` 后缀
    async fn delete_tree(&self, ctx: &dyn TaskCtx, path: &str) -> Result<()> {
        let root = self.get(path).await?;
        let tree = build_entries_tree(ctx, &root).await?;
        let keys: Vec<String> = flatten_entries_tree(tree)
            .into_iter()
            .filter(|e| !is_root_path(e.path()))
            .map(|e| {
                if e.is_dir() {
                    format!("{}/", e.path())
                } else {
                    e.path().to_string()
                }
            })
            .collect();
        ctx.total(keys.len() as i64, false);

        let store = self.store.clone();
        delete_in_batches(ctx, keys, DEFAULT_BATCH_SIZE, move |batch| {
            let store = store.clone();
            async move {
                let failures = store.delete_objects(&batch).await?;
                match failures.first() {
                    Some(f) => Err(DriveError::remote(200, format!("{}: {}", f.key, f.code))),
                    None => Ok(()),
                }
            }
        })
        .await
    }
}

async fn read_chunk(body: &mut Box<dyn ReadSeek>, limit: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = body.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[async_trait]
impl Drive for S3Drive {
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
            return Ok(self.dir_entry(""));
        }
        if let Some(entry) = self.cache.get_entry(&path) {
            return Ok(entry);
        }

        let entry = match self.store.head_object(&path).await {
            Ok(meta) => self.file_entry(&path, meta.size, meta.last_modified),
            Err(e) if e.is_not_found() => {
                // 再尝试目录占位对象
                self.store
                    .head_object(&format!("{}/", path))
                    .await
                    .map_err(|e| if e.is_not_found() { DriveError::not_found(&path) } else { e })?;
                self.dir_entry(&path)
            }
            Err(e) => return Err(e),
        };
        self.cache.put_entry(&entry, self.cache_ttl);
        Ok(entry)
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        self.ensure_alive()?;
        let path = clean_path(path);
        if let Some(children) = self.cache.get_children(&path) {
            return Ok(children);
        }

        let prefix = if is_root_path(&path) {
            String::new()
        } else {
            format!("{}/", path)
        };
        tracing::debug!("S3 ListObjectsV2: prefix={}", prefix);
        let result = self.store.list_objects(&prefix, Some("/")).await?;

        let mut entries = Vec::with_capacity(result.objects.len() + result.common_prefixes.len());
        let mut files = HashSet::new();
        for object in result.objects {
            // 跳过目录占位对象本身
            if object.key == prefix || object.key.ends_with('/') {
                continue;
            }
            entries.push(self.file_entry(&object.key, object.size, object.last_modified));
            files.insert(object.key);
        }
        for dir in result.common_prefixes {
            let dir = dir.trim_end_matches('/');
            // 与文件同名的目录前缀不展示
            if dir.is_empty() || files.contains(dir) {
                continue;
            }
            entries.push(self.dir_entry(dir));
        }

        self.cache.put_children(&path, &entries, self.cache_ttl);
        Ok(entries)
    }

    async fn save(
        &self,
        ctx: &dyn TaskCtx,
        path: &str,
        size: i64,
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

        let mut body = into_seekable(ctx, body, &self.temp_dir).await?;
        let len = seekable_len(&mut body).await?;
        if size >= 0 && size as u64 != len {
            tracing::debug!("S3 save {}: declared size {} differs from body length {}", path, size, len);
        }

        let result = if len > SINGLE_PUT_LIMIT {
            self.put_multipart(ctx, &path, &mut body).await
        } else {
            self.put_single(ctx, &path, &mut body, len).await
        };
        self.evict_with_parent(&path, false);
        result?;
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
        tracing::debug!("S3 PutObject (dir marker): key={}/", path);
        let result = self.store.put_object(&format!("{}/", path), Bytes::new()).await;
        self.evict_with_parent(&path, false);
        result?;
        Ok(self.dir_entry(&path))
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
        self.copy_file(ctx, from, &to, overwrite).await
    }

    async fn move_entry(&self, ctx: &dyn TaskCtx, from: &Entry, to: &str, overwrite: bool) -> Result<CopyOutcome> {
        let outcome = self.copy(ctx, from, to, overwrite).await?;
        if !outcome.is_skipped() {
            let result = self.delete_tree(&DummyContext, from.path()).await;
            self.evict_with_parent(from.path(), true);
            result?;
        }
        Ok(outcome)
    }

    async fn delete(&self, ctx: &dyn TaskCtx, path: &str) -> Result<()> {
        self.ensure_alive()?;
        let path = clean_path(path);
        let result = self.delete_tree(ctx, &path).await;
        self.evict_with_parent(&path, true);
        result
    }

    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        params: &UploadParams,
    ) -> Result<Option<UploadConfig>> {
        self.ensure_alive()?;
        self.negotiator
            .negotiate(self, self.cache.as_ref(), path, size, overwrite, params)
            .await
    }

    async fn open_reader(&self, entry: &Entry) -> Result<BoxReader> {
        self.ensure_alive()?;
        if entry.is_dir() {
            return Err(DriveError::NotAllowed(format!("{} is a directory", entry.path())));
        }
        tracing::debug!("S3 GetObject: key={}", entry.path());
        self.store.get_object(entry.path()).await
    }

    async fn content_url(&self, entry: &Entry) -> Result<Option<ContentUrl>> {
        self.ensure_alive()?;
        if entry.is_dir() {
            return Err(DriveError::NotAllowed(format!("{} is a directory", entry.path())));
        }
        let url = self.store.presign("GET", entry.path(), &[], DOWNLOAD_URL_TTL)?;
        Ok(Some(ContentUrl {
            url,
            proxy: self.proxy_download,
        }))
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.cache.dispose();
            tracing::info!("S3 drive disposed: {}", self.id);
        }
    }
}
