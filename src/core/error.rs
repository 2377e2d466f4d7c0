//! 动作错误类型与恢复动作
//!
//! ActionError 表示「放弃本次操作」的信号（目标不符、界面未出现等）；单步交互失败在调用处记录并继续，不会转成 ActionError。
//! RecoveryAction 由 RecoveryEngine 在会话结束时给出。

use std::time::Duration;

use thiserror::Error;

use crate::world::{Position, WorldError};

/// 动作处理器中止的原因
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("World interaction failed: {0}")]
    World(#[from] WorldError),

    #[error("No storage container within {0} blocks")]
    NoContainer(f64),

    #[error("Target mismatch at {expected}: found {found}")]
    TargetMismatch { expected: Position, found: String },

    #[error("Interface did not open: {0}")]
    InterfaceMissing(String),

    #[error("Target agent {0} is not visible")]
    TargetNotVisible(String),
}

/// 会话结束后的恢复动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 延迟后发起第 `attempt` 次重连
    Reconnect { attempt: u32, delay: Duration },
    /// 主动关闭，不再重连
    Terminate,
    /// 重连次数耗尽，需要外部重启
    GiveUp,
}
