//! 工作队列：严格 FIFO、按 (类型, 目标) 去重
//!
//! DrainNode 以节点坐标作为目标身份；其余类型以类型本身为身份，即同类最多排队一个。
//! `draining` 标记表示已有一个排空循环在执行，防止重入。

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use crate::world::{AgentRef, BlockRef, Position};

/// 动作类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    StoreItems,
    DrainNode,
    LiquidateItems,
    ClearThreats,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::StoreItems => "store_items",
            ActionKind::DrainNode => "drain_node",
            ActionKind::LiquidateItems => "liquidate_items",
            ActionKind::ClearThreats => "clear_threats",
        };
        f.write_str(name)
    }
}

/// 待执行的动作请求，构造后不可变
#[derive(Clone, Debug, PartialEq)]
pub enum ActionRequest {
    StoreItems,
    DrainNode(BlockRef),
    LiquidateItems,
    ClearThreats(AgentRef),
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionRequest::StoreItems => ActionKind::StoreItems,
            ActionRequest::DrainNode(_) => ActionKind::DrainNode,
            ActionRequest::LiquidateItems => ActionKind::LiquidateItems,
            ActionRequest::ClearThreats(_) => ActionKind::ClearThreats,
        }
    }

    /// 去重用的 (类型, 目标) 身份
    pub fn identity(&self) -> (ActionKind, Option<Position>) {
        match self {
            ActionRequest::DrainNode(node) => (ActionKind::DrainNode, Some(node.position)),
            other => (other.kind(), None),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<ActionRequest>,
    draining: bool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, request: &ActionRequest) -> bool {
        let identity = request.identity();
        self.items.iter().any(|queued| queued.identity() == identity)
    }

    /// 追加到队尾；已有等价请求时拒绝并返回 false
    pub fn push(&mut self, request: ActionRequest) -> bool {
        if self.contains(&request) {
            return false;
        }
        self.items.push_back(request);
        true
    }

    pub fn pop_front(&mut self) -> Option<ActionRequest> {
        self.items.pop_front()
    }

    /// 移除所有指定类型的请求，返回移除数量
    pub fn purge(&mut self, kind: ActionKind) -> usize {
        let before = self.items.len();
        self.items.retain(|queued| queued.kind() != kind);
        before - self.items.len()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        removed
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.iter().map(ActionRequest::kind).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionRequest> {
        self.items.iter()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub(crate) fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }
}
