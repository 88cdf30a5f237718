use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vdrive_gateway::config;
use vdrive_gateway::storage::{DriveUtils, StorageManager};
use vdrive_gateway::task::{log_task_events, TaskManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().skip(1).any(|a| a == "-v" || a == "--version") {
        println!(
            "vdrive-gateway {} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("BUILD_TIME")
        );
        return Ok(());
    }

    // Load configuration first, it carries the default log filter / 加载配置
    let app_config = config::load_config()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| app_config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    tracing::info!("Configuration loaded from {:?}", config::get_config_path());

    // Create data and temp directories / 创建数据目录
    let data_dir = app_config.get_data_dir();
    let temp_dir = app_config.get_temp_dir();
    for dir in [&data_dir, &temp_dir] {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            tracing::info!("Created directory: {:?}", dir);
        }
    }

    let storage_manager = StorageManager::new(DriveUtils { temp_dir });
    vdrive_gateway::register_storage_drivers(&storage_manager).await;

    for mount in &app_config.mounts {
        if let Err(e) = storage_manager
            .mount(&mount.path, &mount.driver_type, mount.config.clone())
            .await
        {
            tracing::error!("Failed to mount {} ({}): {}", mount.path, mount.driver_type, e);
        }
    }
    for (mount, error) in storage_manager.get_all_driver_errors().await {
        tracing::warn!("Drive /{} is unhealthy: {}", mount, error);
    }

    let task_manager = TaskManager::new(app_config.max_concurrent_task);
    tokio::spawn(log_task_events(task_manager.subscribe()));

    tracing::info!(
        "vdrive-gateway {} running, mounts: {:?}",
        env!("CARGO_PKG_VERSION"),
        storage_manager.list_mounts().await
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    task_manager.cancel_all();
    storage_manager.dispose_all().await;
    Ok(())
}
