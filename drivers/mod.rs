// Driver package / 驱动包
pub mod local;
pub mod s3;

use std::sync::Arc;

use crate::storage::StorageManager;

/// Register all drivers to StorageManager / 注册所有驱动
pub async fn register_all(manager: &StorageManager) {
    // Register local driver / 注册本地驱动
    manager.register_factory(Arc::new(local::LocalDriverFactory)).await;
    // Register S3 driver / 注册S3对象存储驱动
    manager.register_factory(Arc::new(s3::S3DriverFactory)).await;
}
