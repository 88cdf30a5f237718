//! Local disk driver / 本地磁盘驱动

mod driver;
mod factory;

pub use driver::LocalDrive;
pub use factory::{LocalConfig, LocalDriverFactory};
