//! Application configuration module / 应用配置模块
//!
//! Loaded from config.json in the working directory (`CONFIG_PATH` overrides it).
//! Creates default config file on first run / 首次运行时创建默认配置文件

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application configuration / 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Data directory path / 数据目录路径
    pub data_dir: String,
    /// Spool directory for one-shot upload bodies / 临时文件目录
    pub temp_dir: String,
    /// Concurrent long-running tasks / 最大并发任务数
    pub max_concurrent_task: usize,
    /// Default tracing filter, `RUST_LOG` takes precedence / 日志过滤
    pub log_filter: String,
    /// Drives mounted at startup / 启动时挂载的驱动
    pub mounts: Vec<MountConfig>,
}

/// One mount entry / 挂载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Virtual mount path / 挂载路径
    pub path: String,
    pub driver_type: String,
    /// Driver specific config, parsed by the factory / 驱动配置
    #[serde(default)]
    pub config: Value,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            temp_dir: String::new(),
            max_concurrent_task: 4,
            log_filter: "vdrive_gateway=debug".to_string(),
            mounts: vec![MountConfig {
                path: "/".to_string(),
                driver_type: "local".to_string(),
                config: serde_json::json!({ "root": "data/local" }),
            }],
        }
    }
}

impl AppConfig {
    /// Get the full data directory path / 获取完整的数据目录路径
    pub fn get_data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Temp dir, `<data_dir>/temp` when unset / 获取临时目录
    pub fn get_temp_dir(&self) -> PathBuf {
        if self.temp_dir.is_empty() {
            self.get_data_dir().join("temp")
        } else {
            PathBuf::from(&self.temp_dir)
        }
    }
}

/// Get the config file path / 获取配置文件路径
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("config.json")
}

/// Load configuration from file, or create default if not exists / 加载配置文件，不存在则创建默认配置
pub fn load_config_from(config_path: &Path) -> Result<AppConfig> {
    if config_path.exists() {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", config_path))?;
        tracing::info!("Loaded configuration from {:?}", config_path);
        Ok(config)
    } else {
        let config = AppConfig::default();
        save_config(config_path, &config)?;
        tracing::info!("Created default configuration at {:?}", config_path);
        Ok(config)
    }
}

pub fn load_config() -> Result<AppConfig> {
    load_config_from(&get_config_path())
}

/// Save configuration to file / 保存配置到文件
pub fn save_config(config_path: &Path, config: &AppConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(config_path, content)
        .with_context(|| format!("Failed to write config file {:?}", config_path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_written_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = load_config_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.max_concurrent_task, 4);
        assert_eq!(config.get_temp_dir(), PathBuf::from("data").join("temp"));

        let reloaded = load_config_from(&path).unwrap();
        assert_eq!(reloaded.mounts.len(), 1);
        assert_eq!(reloaded.mounts[0].driver_type, "local");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"temp_dir":"/tmp/x","mounts":[{"path":"/s3","driver_type":"s3"}]}"#,
        )
        .unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.data_dir, "data");
        assert_eq!(config.get_temp_dir(), PathBuf::from("/tmp/x"));
        assert_eq!(config.mounts[0].config, Value::Null);
    }
}
