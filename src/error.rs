//! Drive error types / 驱动错误类型

use thiserror::Error;

/// Errors surfaced by drives and the drive core / 驱动层错误
#[derive(Debug, Error)]
pub enum DriveError {
    /// Path does not exist / 路径不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists and override was not requested / 目标已存在
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Conflicting mutation, e.g. a directory where a file exists / 不允许的操作
    #[error("not allowed: {0}")]
    NotAllowed(String),

    /// Credential or token rejected / 未授权
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Operation not valid for this entry/backend combination / 不支持的操作
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Backend answered with a non-success status / 远端接口错误
    #[error("remote api error [{status}]: {message}")]
    RemoteApi { status: u16, message: String },

    /// Malformed request parameters / 参数错误
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Task was cancelled / 任务已取消
    #[error("task cancelled")]
    Cancelled,

    /// The drive owning an entry has been unmounted / 驱动已卸载
    #[error("drive disposed")]
    Disposed,

    /// Invalid drive configuration / 配置错误
    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DriveError>;

impl DriveError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::RemoteApi { status, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}
