use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek};

use crate::error::{DriveError, Result};
use crate::task::TaskCtx;

/// Input kind of a form item / 表单项类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    String,
    Password,
    Number,
    Bool,
}

/// One field of a drive's mount form / 挂载配置表单项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigItem {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Default value as the form shows it / 默认值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl ConfigItem {
    pub fn new(name: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            name: name.into(),
            kind,
            title: None,
            default: None,
            required: false,
            help: None,
        }
    }

    pub fn title(self, title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), ..self }
    }

    pub fn required(self) -> Self {
        Self { required: true, ..self }
    }

    pub fn default(self, value: impl Into<String>) -> Self {
        Self { default: Some(value.into()), ..self }
    }

    pub fn help(self, help: impl Into<String>) -> Self {
        Self { help: Some(help.into()), ..self }
    }
}

/// Static traits of a driver type / 驱动类型特性
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    /// Metadata is never cached, no `cache_ttl` item / 不使用缓存
    #[serde(default)]
    pub no_cache: bool,
    /// Content always flows through the gateway / 只能中转
    #[serde(default)]
    pub only_proxy: bool,
}

/// Everything a UI needs to render a mount form / 驱动信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    pub config: DriverConfig,
    /// Items every mount has / 通用表单项
    pub common: Vec<ConfigItem>,
    /// Items of this driver type / 驱动表单项
    pub additional: Vec<ConfigItem>,
}

impl DriverInfo {
    pub fn new(config: DriverConfig, additional: Vec<ConfigItem>) -> Self {
        let mut common = vec![ConfigItem::new("mount_path", ItemKind::String)
            .title("挂载路径")
            .required()
            .help("Virtual path the drive is mounted at")];
        if !config.no_cache {
            common.push(
                ConfigItem::new("cache_ttl", ItemKind::Number)
                    .title("缓存时间")
                    .default("0")
                    .help("Metadata cache TTL in seconds, 0 disables caching"),
            );
        }
        Self {
            config,
            common,
            additional,
        }
    }
}

static NEXT_DRIVE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one constructed drive instance / 驱动实例标识
///
/// Two drives of the same backend type (e.g. two buckets) always get
/// different ids, so native copy is only offered between entries and the
/// very instance that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriveId(u64);

impl DriveId {
    pub fn next() -> Self {
        Self(NEXT_DRIVE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drive#{}", self.0)
    }
}

/// Weak binding from an entry to the drive that produced it / 条目到驱动的弱引用
#[derive(Clone)]
pub struct DriveRef {
    id: DriveId,
    handle: Weak<dyn Drive>,
}

impl DriveRef {
    pub fn new(id: DriveId, handle: Weak<dyn Drive>) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> DriveId {
        self.id
    }

    /// Live drive, or `Disposed` once it has been dropped / 获取驱动
    pub fn upgrade(&self) -> Result<Arc<dyn Drive>> {
        self.handle.upgrade().ok_or(DriveError::Disposed)
    }
}

impl fmt::Debug for DriveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Dir,
    File,
}

/// Per-entry capability flags / 条目权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    pub can_read: bool,
    pub can_write: bool,
}

impl Default for EntryMeta {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: true,
        }
    }
}

/// Drive-wide capability flags / 驱动权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveMeta {
    pub can_write: bool,
}

/// One node in the virtual tree / 虚拟树节点
///
/// Entries are immutable. A mutation on the drive produces a new entry.
#[derive(Clone)]
pub struct Entry {
    path: String,
    entry_type: EntryType,
    size: i64,
    mod_time: i64,
    meta: EntryMeta,
    drive: DriveRef,
}

impl Entry {
    pub fn file(drive: DriveRef, path: &str, size: i64, mod_time: i64, meta: EntryMeta) -> Self {
        Self {
            path: crate::utils::clean_path(path),
            entry_type: EntryType::File,
            size,
            mod_time,
            meta,
            drive,
        }
    }

    pub fn dir(drive: DriveRef, path: &str, meta: EntryMeta) -> Self {
        Self {
            path: crate::utils::clean_path(path),
            entry_type: EntryType::Dir,
            size: -1,
            mod_time: -1,
            meta,
            drive,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> String {
        crate::utils::path_base(&self.path)
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Dir
    }

    /// Byte length, -1 for directories / 文件大小
    pub fn size(&self) -> i64 {
        match self.entry_type {
            EntryType::Dir => -1,
            EntryType::File => self.size,
        }
    }

    /// Milliseconds since epoch, -1 for directories / 修改时间
    pub fn mod_time(&self) -> i64 {
        match self.entry_type {
            EntryType::Dir => -1,
            EntryType::File => self.mod_time,
        }
    }

    pub fn meta(&self) -> EntryMeta {
        self.meta
    }

    pub fn drive_id(&self) -> DriveId {
        self.drive.id()
    }

    pub fn drive_ref(&self) -> &DriveRef {
        &self.drive
    }

    pub fn drive(&self) -> Result<Arc<dyn Drive>> {
        self.drive.upgrade()
    }

    /// Open the file content / 打开文件内容
    pub async fn reader(&self) -> Result<BoxReader> {
        self.drive()?.open_reader(self).await
    }

    /// Download URL, if the backend can serve one / 获取下载地址
    pub async fn url(&self) -> Result<Option<ContentUrl>> {
        self.drive()?.content_url(self).await
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path)
            .field("type", &self.entry_type)
            .field("size", &self.size())
            .field("mod_time", &self.mod_time())
            .field("drive", &self.drive)
            .finish()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.entry_type == other.entry_type
            && self.size() == other.size()
            && self.mod_time() == other.mod_time()
            && self.meta == other.meta
            && self.drive.id() == other.drive.id()
    }
}

/// Result of a copy: either written, or skipped because the destination existed
/// 复制结果：已写入或因目标存在而跳过
#[derive(Debug, Clone, PartialEq)]
pub enum CopyOutcome {
    Written(Entry),
    /// Carries the pre-existing destination entry / 携带已存在的目标条目
    Skipped(Entry),
}

impl CopyOutcome {
    pub fn entry(&self) -> &Entry {
        match self {
            Self::Written(e) | Self::Skipped(e) => e,
        }
    }

    pub fn into_entry(self) -> Entry {
        match self {
            Self::Written(e) | Self::Skipped(e) => e,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

pub trait ReadSeek: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> ReadSeek for T {}

pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Body of a save / 上传内容
pub enum ByteSource {
    /// Length known by seeking, can be re-read / 可寻址的内容
    Seekable(Box<dyn ReadSeek>),
    /// One-shot stream, spooled to a temp file when the backend needs a length
    Stream(BoxReader),
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seekable(_) => f.write_str("ByteSource::Seekable"),
            Self::Stream(_) => f.write_str("ByteSource::Stream"),
        }
    }
}

/// Download location for an entry / 下载地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUrl {
    pub url: String,
    /// Downloads must be relayed through the gateway / 是否需要中转下载
    pub proxy: bool,
}

/// Negotiation parameters carried next to path/size/override / 上传协商参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Zero-based part index, clients may send it as a string / 分片序号
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    /// `;`-joined part tags in part order / 分片标签，分号分隔
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

fn lenient_i64<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<NumberOrString>::deserialize(deserializer)? {
        Some(NumberOrString::Number(n)) => Some(n),
        Some(NumberOrString::String(s)) => Some(crate::utils::to_i64(Some(&s), -1)),
        None => None,
    })
}

impl UploadParams {
    pub fn action(&self) -> UploadAction {
        UploadAction::parse(self.action.as_deref())
    }
}

/// Upload negotiation request as sent by clients / 上传协商请求
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub path: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, rename = "override")]
    pub overwrite: bool,
    #[serde(flatten)]
    pub params: UploadParams,
}

/// Negotiation step / 协商步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadAction {
    Initial,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    CompletePutObject,
}

impl UploadAction {
    /// Absent or unrecognized actions start a new negotiation / 未知动作视为初始协商
    pub fn parse(action: Option<&str>) -> Self {
        match action {
            Some("UploadPart") => Self::UploadPart,
            Some("CompleteMultipartUpload") => Self::CompleteMultipartUpload,
            Some("AbortMultipartUpload") => Self::AbortMultipartUpload,
            Some("CompletePutObject") => Self::CompletePutObject,
            _ => Self::Initial,
        }
    }

    /// Steps that hand out a plan and therefore honor `override` / 是否下发上传计划
    pub fn issues_plan(&self) -> bool {
        matches!(self, Self::Initial | Self::UploadPart)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadProvider {
    #[serde(rename = "local-proxy")]
    LocalProxy,
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "multipart")]
    Multipart,
}

/// Negotiated upload plan / 上传计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub provider: UploadProvider,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl UploadConfig {
    /// Bytes go through the gateway / 经网关中转上传
    pub fn local_proxy(size: i64) -> Self {
        Self {
            provider: UploadProvider::LocalProxy,
            config: BTreeMap::new(),
            size: Some(size),
        }
    }

    /// Client talks to the backend with a presigned URL / 客户端直传
    pub fn direct(url: impl Into<String>) -> Self {
        let mut config = BTreeMap::new();
        config.insert("url".to_string(), url.into());
        Self {
            provider: UploadProvider::Direct,
            config,
            size: None,
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

/// Virtual drive contract implemented once per backend family / 虚拟驱动接口
///
/// Paths are virtual tree keys relative to the mount; adapters clean them on entry.
#[async_trait]
pub trait Drive: Send + Sync {
    /// Instance identity / 实例标识
    fn id(&self) -> DriveId;

    fn meta(&self) -> DriveMeta;

    /// Resolve one entry, root is always a synthetic directory / 获取条目
    async fn get(&self, path: &str) -> Result<Entry>;

    /// Children of a directory / 列出目录
    async fn list(&self, path: &str) -> Result<Vec<Entry>>;

    /// Store a file / 保存文件
    async fn save(
        &self,
        ctx: &dyn TaskCtx,
        path: &str,
        size: i64,
        overwrite: bool,
        body: ByteSource,
    ) -> Result<Entry>;

    async fn make_dir(&self, path: &str) -> Result<Entry>;

    /// Backend-native copy, only for entries produced by this instance / 原生复制
    async fn copy(
        &self,
        ctx: &dyn TaskCtx,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<CopyOutcome>;

    /// Copy, then delete the source unless the copy was skipped / 移动
    async fn move_entry(
        &self,
        ctx: &dyn TaskCtx,
        from: &Entry,
        to: &str,
        overwrite: bool,
    ) -> Result<CopyOutcome>;

    /// Remove a path and its subtree / 删除
    async fn delete(&self, ctx: &dyn TaskCtx, path: &str) -> Result<()>;

    /// Upload negotiation, `None` when the step produces no plan / 上传协商
    async fn upload(
        &self,
        path: &str,
        size: i64,
        overwrite: bool,
        params: &UploadParams,
    ) -> Result<Option<UploadConfig>>;

    async fn open_reader(&self, entry: &Entry) -> Result<BoxReader>;

    async fn content_url(&self, entry: &Entry) -> Result<Option<ContentUrl>>;

    /// Release background tasks and clients, idempotent / 释放资源
    async fn dispose(&self);
}

pub mod batch;
pub mod cache;
pub mod manager;
pub mod ops;

pub use cache::{create_cache, CacheRecord, DriveCache, DummyCache, EntryBinder, MemoryCache};
pub use manager::{DriveUtils, DriverFactory, StorageManager};
