//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `VIGIL__*` 覆盖（双下划线表示嵌套，如 `VIGIL__RECONNECT__MAX_ATTEMPTS=3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::world::Credentials;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub resources: ResourcesSection,
    pub posture: PostureSection,
    pub activity: ActivitySection,
    pub triggers: TriggersSection,
    pub store: StoreSection,
    pub drain: DrainSection,
    pub liquidate: LiquidateSection,
    pub threats: ThreatsSection,
    pub emergency: EmergencySection,
    pub reconnect: ReconnectSection,
}

/// [server] 段：连接目标与身份
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: String,
    pub version: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25565,
            username: "vigil".to_string(),
            auth: "microsoft".to_string(),
            version: "1.20".to_string(),
        }
    }
}

impl ServerSection {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth.clone(),
            version: self.version.clone(),
        }
    }
}

/// [resources] 段：目标资源、可变现物品、存储容器与工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    /// 节点方块名，同时也是需要入库的物品名
    pub target_item: String,
    /// 从节点收获、随后变现的物品名
    pub harvest_item: String,
    pub storage_kinds: Vec<String>,
    pub fallback_storage_kinds: Vec<String>,
    pub tool_suffix: String,
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            target_item: "spawner".to_string(),
            harvest_item: "bone".to_string(),
            storage_kinds: vec!["ender_chest".to_string()],
            fallback_storage_kinds: vec!["chest".to_string()],
            tool_suffix: "_pickaxe".to_string(),
        }
    }
}

/// [posture] 段：姿态守护的各个周期（毫秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostureSection {
    pub watch_interval_ms: u64,
    /// 距上次强制超过该值才在巡检中重新强制
    pub lapse_threshold_ms: u64,
    /// wrap 期间的紧密周期
    pub critical_interval_ms: u64,
    /// 挖掘期间的专用周期
    pub break_interval_ms: u64,
    /// 收到姿态被关闭事件后延迟多久重新强制
    pub revert_delay_ms: u64,
}

impl Default for PostureSection {
    fn default() -> Self {
        Self {
            watch_interval_ms: 50,
            lapse_threshold_ms: 1000,
            critical_interval_ms: 20,
            break_interval_ms: 10,
            revert_delay_ms: 10,
        }
    }
}

/// [activity] 段：看门狗
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivitySection {
    pub watchdog_secs: u64,
}

impl Default for ActivitySection {
    fn default() -> Self {
        Self { watchdog_secs: 120 }
    }
}

/// [triggers] 段：周期触发器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggersSection {
    pub node_scan_secs: u64,
    pub inventory_scan_secs: u64,
    pub sentinel_ms: u64,
    pub idle_check_secs: u64,
}

impl Default for TriggersSection {
    fn default() -> Self {
        Self {
            node_scan_secs: 30,
            inventory_scan_secs: 45,
            sentinel_ms: 7500,
            idle_check_secs: 5,
        }
    }
}

/// [store] 段：入库
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub search_radius: f64,
    pub interaction_range: f64,
    pub max_attempts: u32,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            search_radius: 30.0,
            interaction_range: 3.0,
            max_attempts: 3,
        }
    }
}

/// [drain] 段：节点抽取界面的槽位与上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrainSection {
    pub scan_radius: f64,
    pub cursor_range: f64,
    pub click_attempts: u32,
    pub interface_timeout_ms: u64,
    pub max_passes: u32,
    pub container_slots: usize,
    pub slot_capacity: u32,
    pub reveal_slot: usize,
    pub sell_slot: usize,
    pub confirm_slot: usize,
    /// 背包中可变现物品达到该数量才立即变现
    pub min_to_liquidate: u32,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            scan_radius: 5.0,
            cursor_range: 5.0,
            click_attempts: 3,
            interface_timeout_ms: 3000,
            max_passes: 5,
            container_slots: 54,
            slot_capacity: 64,
            reveal_slot: 11,
            sell_slot: 53,
            confirm_slot: 15,
            min_to_liquidate: 1,
        }
    }
}

/// [liquidate] 段：出售界面
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiquidateSection {
    pub command: String,
    pub settle_ms: u64,
    pub sort_slot: usize,
    pub sort_clicks: u32,
    pub delivery_slot: usize,
    pub confirm_slot: usize,
}

impl Default for LiquidateSection {
    fn default() -> Self {
        Self {
            command: "/orders bones".to_string(),
            settle_ms: 1500,
            sort_slot: 47,
            sort_clicks: 3,
            delivery_slot: 0,
            confirm_slot: 15,
        }
    }
}

/// [threats] 段：清除外部代理附近的节点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreatsSection {
    pub search_radius: f64,
    pub max_nodes: usize,
    pub break_timeout_secs: u64,
}

impl Default for ThreatsSection {
    fn default() -> Self {
        Self {
            search_radius: 20.0,
            max_nodes: 20,
            break_timeout_secs: 15,
        }
    }
}

/// 哨兵命中后的响应方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyResponse {
    /// 拆除、入库、断开会话
    #[default]
    Evacuate,
    /// 仅排队 ClearThreats，会话保持
    ClearThreats,
}

/// [emergency] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmergencySection {
    pub detection_radius: f64,
    pub max_sweeps: u32,
    pub response: EmergencyResponse,
}

impl Default for EmergencySection {
    fn default() -> Self {
        Self {
            detection_radius: 500.0,
            max_sweeps: 30,
            response: EmergencyResponse::Evacuate,
        }
    }
}

/// [reconnect] 段：固定延迟 + 上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            delay_ms: 5000,
            max_attempts: 10,
        }
    }
}

impl ReconnectSection {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// 从 config 目录加载配置，环境变量 VIGIL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 VIGIL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("VIGIL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
