//! S3驱动配置

use serde::{Deserialize, Serialize};

use crate::error::{DriveError, Result};

/// S3配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// 存储桶名称
    pub bucket: String,
    /// S3端点地址，留空时使用 AWS 默认端点
    /// 阿里云OSS: https://oss-{region}.aliyuncs.com
    /// MinIO: http://localhost:9000
    #[serde(default)]
    pub endpoint: String,
    /// 区域
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Session Token（用于临时凭证）
    #[serde(default)]
    pub session_token: String,
    /// 强制使用路径风格（而非虚拟主机风格），MinIO等需要设置为true
    #[serde(default)]
    pub force_path_style: bool,
    /// 上传经网关中转
    #[serde(default)]
    pub proxy_upload: bool,
    /// 下载经网关中转
    #[serde(default)]
    pub proxy_download: bool,
    /// 元数据缓存时间（秒），小于等于0时不缓存
    #[serde(default)]
    pub cache_ttl: i64,
    /// 挂载时检查存储桶是否存在
    #[serde(default)]
    pub check_bucket: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Config {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(DriveError::Config("bucket is required".into()));
        }
        if self.access_key_id.is_empty() || self.secret_access_key.is_empty() {
            return Err(DriveError::Config("access key is required".into()));
        }
        Ok(())
    }

    /// 实际使用的端点
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.trim().is_empty() {
            format!("https://s3.{}.amazonaws.com", self.region)
        } else {
            self.endpoint.trim().trim_end_matches('/').to_string()
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: String::new(),
            force_path_style: false,
            proxy_upload: false,
            proxy_download: false,
            cache_ttl: 0,
            check_bucket: false,
        }
    }
}
