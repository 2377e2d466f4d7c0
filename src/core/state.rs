//! 状态定义：ActivityState 单槽互斥状态机与调度快照
//!
//! 任意时刻至多一个活动处于「当前」；每次进入新活动都会分配新的 generation，看门狗与处理器的收尾都以它识别自己的那次激活。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::core::ActionKind;

/// 活动名；`None` 即 Idle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum ActivityName {
    StoringItems,
    Emptying,
    Selling,
    Breaking,
}

impl fmt::Display for ActivityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityName::StoringItems => "storing_items",
            ActivityName::Emptying => "emptying",
            ActivityName::Selling => "selling",
            ActivityName::Breaking => "breaking",
        };
        f.write_str(name)
    }
}

/// 单槽活动状态；只能经由 SchedulerContext 的 set/clear 修改
#[derive(Debug)]
pub struct ActivityState {
    current: Option<ActivityName>,
    started_at: DateTime<Utc>,
    generation: u64,
    watchdog: Option<JoinHandle<()>>,
}

impl Default for ActivityState {
    fn default() -> Self {
        Self {
            current: None,
            started_at: Utc::now(),
            generation: 0,
            watchdog: None,
        }
    }
}

impl ActivityState {
    pub fn current(&self) -> Option<ActivityName> {
        self.current
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// 进入新活动并返回新 generation；已处于同一活动时返回 None
    pub(crate) fn enter(&mut self, name: ActivityName) -> Option<u64> {
        if self.current == Some(name) {
            return None;
        }
        self.cancel_watchdog();
        self.current = Some(name);
        self.started_at = Utc::now();
        self.generation += 1;
        Some(self.generation)
    }

    pub(crate) fn arm(&mut self, watchdog: JoinHandle<()>) {
        self.cancel_watchdog();
        self.watchdog = Some(watchdog);
    }

    /// 回到 Idle，返回之前的活动
    pub(crate) fn clear(&mut self) -> Option<ActivityName> {
        self.cancel_watchdog();
        self.started_at = Utc::now();
        self.current.take()
    }

    /// 看门狗自身触发时使用：不 abort 正在运行的看门狗任务
    pub(crate) fn expire(&mut self) -> Option<ActivityName> {
        self.watchdog.take();
        self.clear()
    }

    pub(crate) fn has_watchdog(&self) -> bool {
        self.watchdog.is_some()
    }

    fn cancel_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

/// 调度器状态快照（日志与测试用）
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerSnapshot {
    pub activity: Option<ActivityName>,
    pub activity_since: Option<DateTime<Utc>>,
    pub queued: Vec<ActionKind>,
    pub draining: bool,
    pub emergency: bool,
    pub shutdown: bool,
    pub watchdog_faults: u64,
}
