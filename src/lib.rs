pub mod config;
pub mod error;
pub mod storage;
pub mod task;
pub mod utils;

// Driver modules (point to project root drivers via path attribute) / 驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use error::{DriveError, Result};

// Register all storage drivers / 注册所有存储驱动
pub async fn register_storage_drivers(manager: &storage::StorageManager) {
    drivers::register_all(manager).await
}
