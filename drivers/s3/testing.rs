//! 内存对象存储（测试用），记录每一次后端调用

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::client::{CompletedPart, DeleteFailure, ListResult, ObjectMeta, ObjectStore};
use crate::error::{DriveError, Result};
use crate::storage::BoxReader;

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Bytes, i64)>>,
    uploads: Mutex<HashMap<String, (String, BTreeMap<i64, Bytes>)>>,
    calls: Mutex<Vec<String>>,
    fail_keys: Mutex<HashSet<String>>,
    completed: Mutex<Vec<Vec<CompletedPart>>>,
    delete_batches: Mutex<Vec<usize>>,
    clock: AtomicI64,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clock: AtomicI64::new(1_600_000_000_000),
            ..Self::default()
        })
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1000, Ordering::Relaxed)
    }

    pub fn insert(&self, key: &str, data: &str) {
        let now = self.tick();
        self.objects
            .lock()
            .insert(key.to_string(), (Bytes::copy_from_slice(data.as_bytes()), now));
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|(b, _)| b.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// 后续 DeleteObjects 对该键报告失败
    pub fn fail_delete(&self, key: &str) {
        self.fail_keys.lock().insert(key.to_string());
    }

    /// 名称以 `op` 开头的调用次数
    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(op)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// 写入类调用次数
    pub fn writes(&self) -> usize {
        ["put_object", "copy_object", "upload_part", "complete_multipart_upload"]
            .iter()
            .map(|op| self.count(op))
            .sum()
    }

    pub fn completed(&self) -> Vec<Vec<CompletedPart>> {
        self.completed.lock().clone()
    }

    pub fn delete_batches(&self) -> Vec<usize> {
        self.delete_batches.lock().clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_bucket(&self) -> Result<()> {
        self.record("head_bucket");
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        self.record("head_object");
        self.objects
            .lock()
            .get(key)
            .map(|(data, mtime)| ObjectMeta {
                key: key.to_string(),
                size: data.len() as i64,
                last_modified: Some(*mtime),
            })
            .ok_or_else(|| DriveError::not_found(key))
    }

    async fn list_objects(&self, prefix: &str, delimiter: Option<&str>) -> Result<ListResult> {
        self.record("list_objects");
        let objects = self.objects.lock();
        let mut result = ListResult::default();
        let mut prefixes = BTreeSet::new();
        for (key, (data, mtime)) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            match delimiter.and_then(|d| rest.find(d).map(|pos| pos + d.len())) {
                Some(end) => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..end]));
                }
                None => result.objects.push(ObjectMeta {
                    key: key.clone(),
                    size: data.len() as i64,
                    last_modified: Some(*mtime),
                }),
            }
        }
        result.common_prefixes = prefixes.into_iter().collect();
        Ok(result)
    }

    async fn get_object(&self, key: &str) -> Result<BoxReader> {
        self.record("get_object");
        let data = self.object(key).ok_or_else(|| DriveError::not_found(key))?;
        Ok(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.record("put_object");
        let now = self.tick();
        self.objects.lock().insert(key.to_string(), (body, now));
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.record("create_multipart_upload");
        let id = uuid::Uuid::new_v4().to_string();
        self.uploads
            .lock()
            .insert(id.clone(), (key.to_string(), BTreeMap::new()));
        Ok(id)
    }

    async fn upload_part(&self, _key: &str, upload_id: &str, part_number: i64, body: Bytes) -> Result<String> {
        self.record("upload_part");
        let mut uploads = self.uploads.lock();
        let (_, parts) = uploads
            .get_mut(upload_id)
            .ok_or_else(|| DriveError::remote(404, "NoSuchUpload"))?;
        parts.insert(part_number, body);
        Ok(format!("etag-{}", part_number))
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        self.record("complete_multipart_upload");
        self.completed.lock().push(parts.to_vec());
        let (_, stored) = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| DriveError::remote(404, "NoSuchUpload"))?;
        let mut data = Vec::new();
        // 客户端直传的分片不经过内存后端，这里只拼接网关上传的分片
        for chunk in parts.iter().filter_map(|p| stored.get(&p.part_number)) {
            data.extend_from_slice(chunk);
        }
        let now = self.tick();
        self.objects
            .lock()
            .insert(key.to_string(), (Bytes::from(data), now));
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.record("abort_multipart_upload");
        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    async fn copy_object(&self, from_key: &str, to_key: &str) -> Result<Option<i64>> {
        self.record("copy_object");
        let data = self.object(from_key).ok_or_else(|| DriveError::not_found(from_key))?;
        let now = self.tick();
        self.objects.lock().insert(to_key.to_string(), (data, now));
        Ok(Some(now))
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<Vec<DeleteFailure>> {
        self.record("delete_objects");
        self.delete_batches.lock().push(keys.len());
        let fail = self.fail_keys.lock().clone();
        let mut objects = self.objects.lock();
        let mut failures = Vec::new();
        for key in keys {
            if fail.contains(key) {
                failures.push(DeleteFailure {
                    key: key.clone(),
                    code: "AccessDenied".into(),
                    message: "Access Denied".into(),
                });
            } else {
                objects.remove(key);
            }
        }
        Ok(failures)
    }

    fn presign(&self, method: &str, key: &str, query: &[(&str, &str)], expires: Duration) -> Result<String> {
        self.record("presign");
        let mut url = format!("https://mem.test/{}?method={}", key, method);
        for (k, v) in query {
            url.push_str(&format!("&{}={}", k, v));
        }
        url.push_str(&format!("&expires={}", expires.as_secs()));
        Ok(url)
    }
}
