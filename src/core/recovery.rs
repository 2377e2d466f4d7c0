//! 重连恢复引擎
//!
//! 根据 ShutdownFlag 与 RetryCounter 返回 RecoveryAction：主动关闭则终止；否则在上限内固定延迟重连，耗尽后放弃。

use std::time::Duration;

use crate::core::RecoveryAction;

/// 有上限的重试计数器；成功连接时归零，每次非自愿断开加一
#[derive(Debug, Clone)]
pub struct RetryCounter {
    count: u32,
    max: u32,
}

impl RetryCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }

    /// 未到上限则加一并返回新值
    pub fn increment(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.count += 1;
        Some(self.count)
    }
}

/// 会话结束时的决策：终止 / 重连 / 放弃
#[derive(Debug)]
pub struct RecoveryEngine {
    retries: RetryCounter,
    delay: Duration,
}

impl RecoveryEngine {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            retries: RetryCounter::new(max_attempts),
            delay,
        }
    }

    pub fn retries(&self) -> &RetryCounter {
        &self.retries
    }

    /// 成功进入 Connected 时调用
    pub fn on_connected(&mut self) {
        self.retries.reset();
    }

    /// 会话结束（或连接失败）时给出下一步动作
    pub fn handle(&mut self, shutting_down: bool) -> RecoveryAction {
        if shutting_down {
            return RecoveryAction::Terminate;
        }
        match self.retries.increment() {
            Some(attempt) => RecoveryAction::Reconnect {
                attempt,
                delay: self.delay,
            },
            None => RecoveryAction::GiveUp,
        }
    }
}
