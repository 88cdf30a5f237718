//! S3 兼容对象存储驱动
//!
//! 支持 AWS S3、MinIO、阿里云OSS 等兼容服务

pub mod client;
pub mod config;
pub mod driver;
pub mod factory;
pub mod signer;
pub mod upload;

#[cfg(test)]
pub mod testing;

pub use client::{ObjectStore, S3Client};
pub use config::S3Config;
pub use driver::S3Drive;
pub use factory::S3DriverFactory;
