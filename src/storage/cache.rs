//! Per-drive metadata cache / 驱动元数据缓存
//!
//! Records are stored detached from any drive and re-bound through the
//! owning drive's binder on every read, so a hit always yields an entry
//! bound to the current instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Entry, EntryType};
use crate::error::Result;
use crate::utils::clean_path;

/// Serializable snapshot of an entry / 条目快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub path: String,
    pub size: i64,
    pub mod_time: i64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

impl From<&Entry> for CacheRecord {
    fn from(entry: &Entry) -> Self {
        Self {
            path: entry.path().to_string(),
            size: entry.size(),
            mod_time: entry.mod_time(),
            entry_type: entry.entry_type(),
        }
    }
}

/// Rebuilds an entry bound to the owning drive / 将快照重新绑定到驱动
pub type EntryBinder = Arc<dyn Fn(&CacheRecord) -> Result<Entry> + Send + Sync>;

/// Metadata cache contract / 缓存接口
///
/// Failures inside the cache are never surfaced: a record that cannot be
/// re-bound is reported as a miss.
pub trait DriveCache: Send + Sync {
    fn get_entry(&self, path: &str) -> Option<Entry>;

    fn put_entry(&self, entry: &Entry, ttl: Duration);

    /// Cached listing of a directory / 缓存的目录列表
    fn get_children(&self, path: &str) -> Option<Vec<Entry>>;

    fn put_children(&self, path: &str, entries: &[Entry], ttl: Duration);

    /// Drop the entry and listing at `path`, and everything below it when recursive
    /// 清除缓存，recursive 时同时清除子路径
    fn evict(&self, path: &str, recursive: bool);

    fn clear(&self);

    /// Stop background work / 停止后台任务
    fn dispose(&self);
}

/// Longest lifetime a slot can get / 缓存最长有效期
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

struct Slot<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Slot<T> {
    fn new(value: T, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now),
        }
    }

    fn alive(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Slot<CacheRecord>>,
    children: HashMap<String, Slot<Vec<CacheRecord>>>,
}

impl CacheState {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len() + self.children.len();
        self.entries.retain(|_, slot| slot.alive(now));
        self.children.retain(|_, slot| slot.alive(now));
        before - self.entries.len() - self.children.len()
    }
}

fn is_under(key: &str, prefix: &str) -> bool {
    prefix.is_empty() || key == prefix || key.starts_with(&format!("{}/", prefix))
}

/// In-memory TTL cache with a background sweeper / 内存缓存
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
    binder: EntryBinder,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl MemoryCache {
    /// The sweeper only starts inside a tokio runtime; expiry is still
    /// enforced lazily without it.
    pub fn new(binder: EntryBinder, sweep_interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(CacheState::default()));
        let cancel = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = Arc::downgrade(&state);
            let token = cancel.clone();
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(state) = state.upgrade() else { break };
                            let removed = state.lock().sweep(Instant::now());
                            if removed > 0 {
                                tracing::debug!("cache sweeper removed {} expired slots", removed);
                            }
                        }
                    }
                }
            });
        }

        Self {
            state,
            binder,
            cancel,
            disposed: AtomicBool::new(false),
        }
    }

    fn bind(&self, record: &CacheRecord) -> Option<Entry> {
        match (self.binder)(record) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("cache record {} dropped: {}", record.path, e);
                None
            }
        }
    }

    /// Live entry records as JSON / 导出缓存条目
    pub fn export_records(&self) -> Result<String> {
        let now = Instant::now();
        let state = self.state.lock();
        let records: Vec<&CacheRecord> = state
            .entries
            .values()
            .filter(|slot| slot.alive(now))
            .map(|slot| &slot.value)
            .collect();
        serde_json::to_string(&records)
            .map_err(|e| crate::error::DriveError::InvalidArgument(e.to_string()))
    }

    /// Load entry records exported earlier, returns how many were imported
    /// 导入缓存条目
    pub fn import_records(&self, json: &str, ttl: Duration) -> Result<usize> {
        let records: Vec<CacheRecord> = serde_json::from_str(json)
            .map_err(|e| crate::error::DriveError::InvalidArgument(e.to_string()))?;
        let count = records.len();
        let mut state = self.state.lock();
        for record in records {
            let key = clean_path(&record.path);
            state.entries.insert(key, Slot::new(record, ttl));
        }
        Ok(count)
    }
}

impl DriveCache for MemoryCache {
    fn get_entry(&self, path: &str) -> Option<Entry> {
        let key = clean_path(path);
        let record = {
            let mut state = self.state.lock();
            match state.entries.get(&key) {
                Some(slot) if slot.alive(Instant::now()) => slot.value.clone(),
                Some(_) => {
                    state.entries.remove(&key);
                    return None;
                }
                None => return None,
            }
        };
        self.bind(&record)
    }

    fn put_entry(&self, entry: &Entry, ttl: Duration) {
        let record = CacheRecord::from(entry);
        self.state
            .lock()
            .entries
            .insert(record.path.clone(), Slot::new(record, ttl));
    }

    fn get_children(&self, path: &str) -> Option<Vec<Entry>> {
        let key = clean_path(path);
        let records = {
            let mut state = self.state.lock();
            match state.children.get(&key) {
                Some(slot) if slot.alive(Instant::now()) => slot.value.clone(),
                Some(_) => {
                    state.children.remove(&key);
                    return None;
                }
                None => return None,
            }
        };
        // One unbindable child invalidates the whole listing
        records.iter().map(|r| self.bind(r)).collect()
    }

    fn put_children(&self, path: &str, entries: &[Entry], ttl: Duration) {
        let records = entries.iter().map(CacheRecord::from).collect();
        self.state
            .lock()
            .children
            .insert(clean_path(path), Slot::new(records, ttl));
    }

    fn evict(&self, path: &str, recursive: bool) {
        let key = clean_path(path);
        let mut state = self.state.lock();
        state.entries.remove(&key);
        state.children.remove(&key);
        if recursive {
            state.entries.retain(|k, _| !is_under(k, &key));
            state.children.retain(|k, _| !is_under(k, &key));
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.children.clear();
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            self.clear();
        }
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cache that never hits / 空缓存
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyCache;

impl DriveCache for DummyCache {
    fn get_entry(&self, _path: &str) -> Option<Entry> {
        None
    }

    fn put_entry(&self, _entry: &Entry, _ttl: Duration) {}

    fn get_children(&self, _path: &str) -> Option<Vec<Entry>> {
        None
    }

    fn put_children(&self, _path: &str, _entries: &[Entry], _ttl: Duration) {}

    fn evict(&self, _path: &str, _recursive: bool) {}

    fn clear(&self) {}

    fn dispose(&self) {}
}

/// Pick the cache for a drive from its TTL in seconds / 根据 TTL 创建缓存
pub fn create_cache(ttl_secs: i64, binder: EntryBinder) -> Arc<dyn DriveCache> {
    if ttl_secs <= 0 {
        return Arc::new(DummyCache);
    }
    let interval = Duration::from_secs(ttl_secs.clamp(1, 60) as u64);
    Arc::new(MemoryCache::new(binder, interval))
}
