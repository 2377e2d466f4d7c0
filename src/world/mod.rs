//! World API 抽象
//!
//! 调度核心只依赖这里定义的窄接口：会话建立、姿态控制、方块/实体查询、背包、窗口交互与聊天。
//! 具体平台绑定实现 `World` 与 `WorldConnector`；`mock` 提供内存实现，供测试与离线运行使用。

pub mod mock;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use mock::{MockConnector, MockWorld};

/// World API 返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Interaction timed out: {0}")]
    Timeout(String),

    #[error("No window open")]
    NoWindow,

    #[error("Session closed")]
    SessionClosed,
}

/// 方块坐标（整数网格）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// 方块中心点，用于瞄准
    pub fn center(&self) -> Vec3 {
        Vec3::new(
            f64::from(self.x) + 0.5,
            f64::from(self.y) + 0.5,
            f64::from(self.z) + 0.5,
        )
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// 连续坐标（实体位置、瞄准点）
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Vec3) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// 所在方块
    pub fn block(&self) -> Position {
        Position::new(
            self.x.floor() as i32,
            self.y.floor() as i32,
            self.z.floor() as i32,
        )
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1}, {:.1})", self.x, self.y, self.z)
    }
}

/// 世界中的一个方块引用：类型名 + 位置
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockRef {
    pub kind: String,
    pub position: Position,
}

impl BlockRef {
    pub fn new(kind: impl Into<String>, position: Position) -> Self {
        Self {
            kind: kind.into(),
            position,
        }
    }
}

/// 其它代理（玩家）的引用；`position` 为 None 表示不在可视范围内
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentRef {
    pub name: String,
    pub position: Option<Vec3>,
}

/// 背包或窗口中的一格物品
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemStack {
    pub id: u32,
    pub name: String,
    pub count: u32,
}

impl ItemStack {
    pub fn new(id: u32, name: impl Into<String>, count: u32) -> Self {
        Self {
            id,
            name: name.into(),
            count,
        }
    }
}

/// 当前打开窗口的快照
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowView {
    pub id: u32,
    pub title: String,
    pub slots: Vec<Option<ItemStack>>,
}

impl WindowView {
    pub fn new(id: u32, title: impl Into<String>, slots: Vec<Option<ItemStack>>) -> Self {
        Self {
            id,
            title: title.into(),
            slots,
        }
    }

    pub fn slot(&self, index: usize) -> Option<&ItemStack> {
        self.slots.get(index).and_then(Option::as_ref)
    }
}

/// 挖掘选项
#[derive(Clone, Copy, Debug)]
pub struct BreakOptions {
    pub force_look: bool,
    pub timeout: Duration,
}

/// 会话事件（由 World API 推送）
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Spawned,
    LoginConfirmed,
    Error(String),
    Kicked(String),
    Ended,
    /// 世界侧报告的姿态变化
    PostureChanged(bool),
}

/// 连接凭据
#[derive(Clone, Debug)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: String,
    pub version: String,
}

/// 一次成功连接得到的会话：World 句柄 + 事件流
pub struct Session {
    pub world: std::sync::Arc<dyn World>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// 建立会话
#[async_trait]
pub trait WorldConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Session, WorldError>;
}

/// 代理所在世界的交互接口
#[async_trait]
pub trait World: Send + Sync {
    /// 受控代理自己的名字
    fn username(&self) -> String;

    fn position(&self) -> Vec3;

    // 姿态
    fn posture(&self) -> bool;
    fn set_posture(&self, on: bool);

    // 几何查询
    fn find_nearest_block(&self, kinds: &[String], max_distance: f64) -> Option<BlockRef>;
    fn find_blocks(
        &self,
        kind: &str,
        max_distance: f64,
        origin: Vec3,
        limit: usize,
    ) -> Vec<Position>;
    fn block_at(&self, position: Position) -> Option<BlockRef>;
    fn block_at_cursor(&self, max_distance: f64) -> Option<BlockRef>;

    // 动作
    async fn look_at(&self, target: Vec3) -> Result<(), WorldError>;
    async fn activate_block(&self, block: &BlockRef) -> Result<(), WorldError>;
    async fn break_block(&self, block: &BlockRef, options: BreakOptions) -> Result<(), WorldError>;
    async fn equip(&self, item: &ItemStack) -> Result<(), WorldError>;

    // 背包
    fn items(&self) -> Vec<ItemStack>;
    fn empty_slot_count(&self) -> u32;

    // 窗口
    async fn open_container(&self, block: &BlockRef) -> Result<WindowView, WorldError>;
    fn current_window(&self) -> Option<WindowView>;
    /// 订阅窗口打开事件；需在触发交互之前订阅
    fn subscribe_windows(&self) -> broadcast::Receiver<WindowView>;
    async fn deposit(&self, item_id: u32, count: u32) -> Result<(), WorldError>;
    async fn withdraw(&self, item_id: u32, count: u32) -> Result<(), WorldError>;
    async fn click_slot(&self, slot: usize, button: u8, mode: u8) -> Result<(), WorldError>;
    fn close_window(&self);

    // 通讯与会话
    fn send_chat(&self, text: &str);
    fn players(&self) -> HashMap<String, AgentRef>;
    fn quit(&self);
}

/// 统计背包中指定名称物品的总数
pub fn held_count(world: &dyn World, name: &str) -> u32 {
    world
        .items()
        .iter()
        .filter(|stack| stack.name == name)
        .map(|stack| stack.count)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_center_and_back() {
        let pos = Position::new(3, -2, 7);
        let center = pos.center();
        assert_eq!(center, Vec3::new(3.5, -1.5, 7.5));
        assert_eq!(center.block(), pos);
    }

    #[test]
    fn test_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < f64::EPSILON);
    }
}
