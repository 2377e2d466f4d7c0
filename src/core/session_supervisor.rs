//! 会话监管：每个 Session 一个取消令牌
//!
//! 会话结束时 cancel，调度器派生的任务随之丢弃；触发器使用子 token，紧急模式可以只停触发器而不结束会话。

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 单个 Session 的生命周期范围
#[derive(Debug)]
pub struct SessionSupervisor {
    id: Uuid,
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 会话结束
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 创建子 token（用于会话内的延迟任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
