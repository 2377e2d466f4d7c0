//! Vigil - 单代理活动调度器
//!
//! 入口：初始化日志、加载配置、安装信号处理，然后运行连接管理器直到主动关闭或重连耗尽。

use std::path::PathBuf;
use std::sync::Arc;

use vigil::config::{load_config, AppConfig};
use vigil::core::{ConnectionManager, ConnectionOutcome, ShutdownManager};
use vigil::world::{MockConnector, MockWorld, Position, Vec3, WindowView};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    vigil::observability::init();

    let config_path = std::env::var_os("VIGIL_CONFIG").map(PathBuf::from);
    let config = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    // 目前只有内存世界绑定
    tracing::warn!(
        host = %config.server.host,
        "No platform binding configured, running against the in-memory world"
    );
    let target = config.resources.target_item.clone();
    let harvest = config.resources.harvest_item.clone();
    let storage = config
        .resources
        .storage_kinds
        .first()
        .cloned()
        .unwrap_or_else(|| "chest".to_string());
    let username = config.server.username.clone();
    let connector = MockConnector::new(move || {
        let mut contents = vec![None; 54];
        contents[0] = Some(vigil::world::mock::stack(&harvest, 64));
        MockWorld::new(&username)
            .with_position(Vec3::new(0.5, 64.0, 0.5))
            .with_block(&target, Position::new(2, 64, 0))
            .with_block(&storage, Position::new(0, 64, 2))
            .with_block_window(&target, WindowView::new(0, "Node", contents))
    });

    let mut reasons = shutdown.subscribe();
    let mut manager = ConnectionManager::new(Arc::new(connector), config, (*shutdown).clone());
    match manager.run().await {
        ConnectionOutcome::Terminated => {
            match reasons.try_recv() {
                Ok(reason) => tracing::info!(?reason, "Exited cleanly"),
                Err(_) => tracing::info!("Exited cleanly"),
            }
            Ok(())
        }
        ConnectionOutcome::Fatal { attempts } => {
            anyhow::bail!("Gave up after {attempts} reconnection attempts, restart required")
        }
    }
}
