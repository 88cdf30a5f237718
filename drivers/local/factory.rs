use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::LocalDrive;
use crate::storage::{ConfigItem, Drive, DriveUtils, DriverConfig, DriverFactory, ItemKind};

/// Local driver config / 本地驱动配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root directory on disk, created when missing / 根目录
    pub root: String,
}

pub struct LocalDriverFactory;

#[async_trait]
impl DriverFactory for LocalDriverFactory {
    fn driver_type(&self) -> &'static str {
        "local"
    }

    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            name: "Local".to_string(),
            only_proxy: true,
            no_cache: true,
        }
    }

    fn additional_items(&self) -> Vec<ConfigItem> {
        vec![ConfigItem::new("root", ItemKind::String)
            .title("根目录")
            .required()
            .help("本地磁盘上的根目录，不存在时自动创建")]
    }

    async fn create_driver(&self, config: Value, _utils: &DriveUtils) -> Result<Arc<dyn Drive>> {
        let config: LocalConfig = serde_json::from_value(config)
            .map_err(|e| anyhow!("缺少 root 配置: {}", e))?;
        if config.root.trim().is_empty() {
            return Err(anyhow!("缺少 root 配置"));
        }

        let root = PathBuf::from(&config.root);
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            tokio::fs::create_dir_all(&root).await?;
        }
        let canonical_root = tokio::fs::canonicalize(&root).await?;

        tracing::info!("Local driver initialized, root: {:?}", canonical_root);
        Ok(LocalDrive::new(canonical_root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_driver_makes_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested/root");
        let utils = DriveUtils {
            temp_dir: std::env::temp_dir(),
        };
        let drive = LocalDriverFactory
            .create_driver(serde_json::json!({ "root": root }), &utils)
            .await
            .unwrap();
        assert!(root.is_dir());
        assert!(drive.list("").await.unwrap().is_empty());

        assert!(LocalDriverFactory
            .create_driver(serde_json::json!({}), &utils)
            .await
            .is_err());
        assert!(!LocalDriverFactory.driver_info().common.iter().any(|i| i.name == "cache_ttl"));
    }
}
