//! Vigil - 单代理活动调度器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 调度上下文、活动状态与看门狗、工作队列、姿态守护、哨兵与紧急撤离、连接恢复
//! - **actions**: 动作处理器（入库、节点抽取、变现、清除威胁）
//! - **world**: World API 抽象与内存实现
//! - **observability**: 日志初始化

pub mod actions;
pub mod config;
pub mod core;
pub mod observability;
pub mod world;

pub use crate::core::{ConnectionManager, ConnectionOutcome, Scheduler, SchedulerContext};
