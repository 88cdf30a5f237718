//! S3驱动工厂

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::client::{ObjectStore, S3Client};
use super::config::S3Config;
use super::driver::S3Drive;
use crate::storage::{ConfigItem, Drive, DriveUtils, DriverConfig, DriverFactory, ItemKind};

/// S3驱动工厂
pub struct S3DriverFactory;

#[async_trait]
impl DriverFactory for S3DriverFactory {
    fn driver_type(&self) -> &'static str {
        "s3"
    }

    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            name: "S3".to_string(),
            no_cache: false,
            only_proxy: false, // 支持预签名URL直链
        }
    }

    fn additional_items(&self) -> Vec<ConfigItem> {
        vec![
            ConfigItem::new("bucket", ItemKind::String)
                .title("存储桶名称")
                .help("S3存储桶名称")
                .required(),
            ConfigItem::new("endpoint", ItemKind::String)
                .title("端点地址")
                .help("S3端点URL，留空使用AWS（MinIO: http://localhost:9000）"),
            ConfigItem::new("region", ItemKind::String)
                .title("区域")
                .help("S3区域，如 us-east-1、cn-hangzhou")
                .default("us-east-1"),
            ConfigItem::new("access_key_id", ItemKind::String)
                .title("Access Key ID")
                .required(),
            ConfigItem::new("secret_access_key", ItemKind::Password)
                .title("Secret Access Key")
                .required(),
            ConfigItem::new("session_token", ItemKind::Password)
                .title("Session Token")
                .help("临时凭证的会话令牌（可选）"),
            ConfigItem::new("force_path_style", ItemKind::Bool)
                .title("强制路径风格")
                .help("MinIO等需要开启此选项")
                .default("false"),
            ConfigItem::new("proxy_upload", ItemKind::Bool)
                .title("中转上传")
                .help("上传经网关中转，而不是客户端直传")
                .default("false"),
            ConfigItem::new("proxy_download", ItemKind::Bool)
                .title("中转下载")
                .help("下载经网关中转，而不是302到预签名URL")
                .default("false"),
            ConfigItem::new("check_bucket", ItemKind::Bool)
                .title("检查存储桶")
                .help("挂载时确认存储桶存在")
                .default("false"),
        ]
    }

    async fn create_driver(&self, config: Value, utils: &DriveUtils) -> Result<Arc<dyn Drive>> {
        let config: S3Config = serde_json::from_value(config)
            .map_err(|e| anyhow!("配置解析失败: {}", e))?;
        config.validate()?;

        let client = Arc::new(S3Client::new(&config)?);
        if config.check_bucket {
            client.head_bucket().await?;
        }
        tracing::debug!(
            "S3 drive created: bucket={}, endpoint={}",
            config.bucket,
            config.endpoint_url()
        );
        Ok(S3Drive::new(client, &config, utils.temp_dir.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_driver_validates_config() {
        let utils = DriveUtils {
            temp_dir: std::env::temp_dir(),
        };
        let err = S3DriverFactory
            .create_driver(serde_json::json!({ "bucket": "b" }), &utils)
            .await;
        assert!(err.is_err());

        let err = S3DriverFactory
            .create_driver(
                serde_json::json!({ "bucket": " ", "access_key_id": "a", "secret_access_key": "s" }),
                &utils,
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_create_driver() {
        let utils = DriveUtils {
            temp_dir: std::env::temp_dir(),
        };
        let drive = S3DriverFactory
            .create_driver(
                serde_json::json!({
                    "bucket": "b",
                    "endpoint": "http://127.0.0.1:9000",
                    "access_key_id": "a",
                    "secret_access_key": "s",
                    "force_path_style": true,
                }),
                &utils,
            )
            .await
            .unwrap();
        assert!(drive.meta().can_write);
        assert!(drive.get("").await.unwrap().is_dir());
        drive.dispose().await;
    }

    #[test]
    fn test_driver_info() {
        let info = S3DriverFactory.driver_info();
        assert!(info.additional.iter().any(|i| i.name == "bucket" && i.required));
        assert!(info.common.iter().any(|i| i.name == "cache_ttl"));
    }
}
