use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ConfigItem, Drive, DriverConfig, DriverInfo};
use crate::utils::{clean_path, path_depth, path_parent_tree};

/// Shared resources handed to factories / 驱动公共资源
#[derive(Debug, Clone)]
pub struct DriveUtils {
    /// Where one-shot bodies are spooled / 临时文件目录
    pub temp_dir: PathBuf,
}

/// Driver factory trait / 驱动工厂 trait
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Driver type name / 驱动类型名称
    fn driver_type(&self) -> &'static str;

    /// Return driver basic config / 返回驱动基本配置
    fn driver_config(&self) -> DriverConfig;

    /// Return driver specific config items / 返回驱动特有配置项
    fn additional_items(&self) -> Vec<ConfigItem>;

    /// 创建驱动实例
    async fn create_driver(&self, config: Value, utils: &DriveUtils) -> Result<Arc<dyn Drive>>;

    /// Form description for this driver type / 驱动表单信息
    fn driver_info(&self) -> DriverInfo {
        DriverInfo::new(self.driver_config(), self.additional_items())
    }
}

/// Storage manager (mount table of all drive instances) / 存储管理器
#[derive(Clone)]
pub struct StorageManager {
    drives: Arc<RwLock<HashMap<String, Arc<dyn Drive>>>>,
    factories: Arc<RwLock<HashMap<String, Arc<dyn DriverFactory>>>>,
    /// Mount error status (mount path -> error message) / 挂载错误状态
    driver_errors: Arc<RwLock<HashMap<String, String>>>,
    utils: DriveUtils,
}

impl StorageManager {
    pub fn new(utils: DriveUtils) -> Self {
        Self {
            drives: Arc::new(RwLock::new(HashMap::new())),
            factories: Arc::new(RwLock::new(HashMap::new())),
            driver_errors: Arc::new(RwLock::new(HashMap::new())),
            utils,
        }
    }

    /// Register driver factory / 注册驱动工厂
    pub async fn register_factory(&self, factory: Arc<dyn DriverFactory>) {
        let driver_type = factory.driver_type().to_string();
        self.factories
            .write()
            .await
            .insert(driver_type.clone(), factory);
        tracing::info!("Driver factory registered: {}", driver_type);
    }

    /// List all available driver types / 列出所有可用的驱动类型
    pub async fn list_driver_types(&self) -> Vec<String> {
        self.factories.read().await.keys().cloned().collect()
    }

    /// Driver info of every registered factory / 获取所有驱动信息
    pub async fn driver_infos(&self) -> Vec<DriverInfo> {
        self.factories
            .read()
            .await
            .values()
            .map(|f| f.driver_info())
            .collect()
    }

    /// Mount a drive (verify on success, record error on failure) / 挂载驱动
    ///
    /// A drive whose root listing fails is still mounted; the failure is
    /// kept as its error status.
    pub async fn mount(&self, mount_path: &str, driver_type: &str, config: Value) -> Result<Arc<dyn Drive>> {
        let mount_path = clean_path(mount_path);
        if self.drives.read().await.contains_key(&mount_path) {
            return Err(anyhow!("Mount path already in use: /{}", mount_path));
        }

        let factory = self
            .factories
            .read()
            .await
            .get(driver_type)
            .cloned()
            .ok_or_else(|| anyhow!("Driver type not found: {}", driver_type))?;

        let drive = match factory.create_driver(config, &self.utils).await {
            Ok(drive) => drive,
            Err(e) => {
                let error_msg = e.to_string();
                self.driver_errors
                    .write()
                    .await
                    .insert(mount_path.clone(), error_msg.clone());
                tracing::error!("Drive creation failed: /{} ({}) - {}", mount_path, driver_type, error_msg);
                return Err(e);
            }
        };

        // Verify drive validity: try list root directory / 验证驱动有效性
        let validation = drive.list("").await;
        self.drives
            .write()
            .await
            .insert(mount_path.clone(), drive.clone());

        let mut errors = self.driver_errors.write().await;
        match validation {
            Ok(_) => {
                errors.remove(&mount_path);
                tracing::info!("Drive mounted and verified: /{} ({})", mount_path, driver_type);
            }
            Err(e) => {
                let error_msg = e.to_string();
                errors.insert(mount_path.clone(), error_msg.clone());
                tracing::warn!(
                    "Drive mounted but verification failed: /{} ({}) - {}",
                    mount_path,
                    driver_type,
                    error_msg
                );
            }
        }
        Ok(drive)
    }

    /// Unmount and dispose a drive / 卸载驱动
    pub async fn unmount(&self, mount_path: &str) -> Result<()> {
        let mount_path = clean_path(mount_path);
        let drive = self
            .drives
            .write()
            .await
            .remove(&mount_path)
            .ok_or_else(|| anyhow!("Drive not found: /{}", mount_path))?;
        self.driver_errors.write().await.remove(&mount_path);
        drive.dispose().await;
        tracing::info!("Drive unmounted: /{}", mount_path);
        Ok(())
    }

    /// Get mount error status / 获取挂载错误状态
    pub async fn get_driver_error(&self, mount_path: &str) -> Option<String> {
        self.driver_errors
            .read()
            .await
            .get(&clean_path(mount_path))
            .cloned()
    }

    pub async fn get_all_driver_errors(&self) -> HashMap<String, String> {
        self.driver_errors.read().await.clone()
    }

    /// List all mount paths / 列出所有挂载点
    pub async fn list_mounts(&self) -> Vec<String> {
        let mut mounts: Vec<String> = self.drives.read().await.keys().cloned().collect();
        mounts.sort();
        mounts
    }

    /// Resolve path to the drive with the longest matching mount and the
    /// path relative to it / 根据路径解析到对应的驱动
    pub async fn resolve_path(&self, path: &str) -> Option<(Arc<dyn Drive>, String)> {
        let path = clean_path(path);
        let drives = self.drives.read().await;

        // 从最深的祖先开始找，第一个命中的就是最长挂载
        path_parent_tree(&path).into_iter().find_map(|mount| {
            let drive = drives.get(&mount)?;
            let relative: Vec<&str> = path.split('/').skip(path_depth(&mount)).collect();
            Some((drive.clone(), relative.join("/")))
        })
    }

    /// Dispose every mounted drive (shutdown) / 释放所有驱动
    pub async fn dispose_all(&self) {
        let drives: Vec<(String, Arc<dyn Drive>)> = self.drives.write().await.drain().collect();
        for (mount, drive) in drives {
            drive.dispose().await;
            tracing::debug!("Drive disposed: /{}", mount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::local::LocalDriverFactory;

    fn manager() -> StorageManager {
        StorageManager::new(DriveUtils {
            temp_dir: std::env::temp_dir(),
        })
    }

    #[tokio::test]
    async fn test_mount_and_resolve() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let m = manager();
        m.register_factory(Arc::new(LocalDriverFactory)).await;

        let da = m
            .mount("/", "local", serde_json::json!({ "root": a.path() }))
            .await
            .unwrap();
        let db = m
            .mount("/data/b", "local", serde_json::json!({ "root": b.path() }))
            .await
            .unwrap();

        let (d, rel) = m.resolve_path("/data/b/x/y.txt").await.unwrap();
        assert_eq!(d.id(), db.id());
        assert_eq!(rel, "x/y.txt");
        let (d, rel) = m.resolve_path("/data/bx").await.unwrap();
        assert_eq!(d.id(), da.id());
        assert_eq!(rel, "data/bx");
        let (_, rel) = m.resolve_path("data/b").await.unwrap();
        assert_eq!(rel, "");

        assert!(m.mount("data/b", "local", serde_json::json!({ "root": b.path() })).await.is_err());
        m.unmount("/data/b").await.unwrap();
        assert_eq!(m.list_mounts().await, vec![String::new()]);
        m.dispose_all().await;
        assert!(m.resolve_path("a").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_driver_type() {
        let m = manager();
        assert!(m.mount("x", "nope", Value::Null).await.is_err());
        assert!(m.get_driver_error("x").await.is_none());
    }
}
