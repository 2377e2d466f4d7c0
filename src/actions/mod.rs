//! 动作处理器：StoreItems、DrainNode、LiquidateItems、ClearThreats
//!
//! 每个处理器都以 `impl Scheduler` 的形式挂在调度器上，先通过 `claim` 获取活动槽，再在姿态守护的 `wrap` 中执行交互。
//! 这里放处理器共用的工具选择与挖掘逻辑。

pub mod clear_threats;
pub mod drain_node;
pub mod liquidate;
pub mod store;

use std::time::Duration;

use crate::core::Scheduler;
use crate::world::{AgentRef, BlockRef, BreakOptions, ItemStack, Position, Vec3, WorldError};

pub use drain_node::NodeInteraction;
pub use liquidate::dominant_variant;

/// 工具材质等级，未知材质最低
fn material_rank(name: &str) -> i32 {
    const RANKS: [&str; 6] = ["wooden", "stone", "iron", "golden", "diamond", "netherite"];
    RANKS
        .iter()
        .position(|material| name.starts_with(material))
        .map_or(-1, |rank| rank as i32)
}

/// 背包中等级最高的挖掘工具；同级取先出现的
pub fn best_tool(items: &[ItemStack], suffix: &str) -> Option<ItemStack> {
    items
        .iter()
        .filter(|item| item.name.ends_with(suffix))
        .fold(None::<&ItemStack>, |best, item| match best {
            Some(current) if material_rank(&current.name) >= material_rank(&item.name) => {
                Some(current)
            }
            _ => Some(item),
        })
        .cloned()
}

impl Scheduler {
    /// 装备最好的工具；没有工具或装备失败时只记录日志
    pub(crate) async fn equip_best_tool(&self) -> Option<ItemStack> {
        let suffix = &self.config().resources.tool_suffix;
        let Some(tool) = best_tool(&self.world().items(), suffix) else {
            tracing::warn!("No suitable tool found, breaking bare-handed");
            return None;
        };
        match self.world().equip(&tool).await {
            Ok(()) => {
                tracing::info!(tool = %tool.name, "Equipped tool");
                Some(tool)
            }
            Err(e) => {
                tracing::warn!(tool = %tool.name, error = %e, "Failed to equip tool");
                None
            }
        }
    }

    /// 朝向并挖掘一个节点；挖掘期间使用更高频率的姿态循环，整体受超时约束
    pub(crate) async fn break_node(&self, block: &BlockRef) -> Result<(), WorldError> {
        let world = self.world();
        world.look_at(block.position.center()).await?;

        let timeout = Duration::from_secs(self.config().threats.break_timeout_secs);
        let period = Duration::from_millis(self.config().posture.break_interval_ms);
        let options = BreakOptions {
            force_look: true,
            timeout,
        };
        self.posture()
            .wrap_with(period, async {
                match tokio::time::timeout(timeout, world.break_block(block, options)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorldError::Timeout(format!("break at {}", block.position))),
                }
            })
            .await
    }

    /// 外部代理的最新位置；不可见时退回请求里携带的位置
    pub(crate) fn locate(&self, agent: &AgentRef) -> Option<Vec3> {
        self.world()
            .players()
            .get(&agent.name)
            .and_then(|fresh| fresh.position)
            .or(agent.position)
    }

    /// 仍在原位的目标节点
    pub(crate) fn target_node_at(&self, position: Position) -> Option<BlockRef> {
        let target = &self.config().resources.target_item;
        self.world()
            .block_at(position)
            .filter(|block| &block.kind == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::mock::stack;

    #[test]
    fn test_best_tool_prefers_highest_material() {
        let items = vec![
            stack("stone_pickaxe", 1),
            stack("diamond_pickaxe", 1),
            stack("bone", 12),
            stack("iron_pickaxe", 1),
        ];
        assert_eq!(best_tool(&items, "_pickaxe").unwrap().name, "diamond_pickaxe");
    }

    #[test]
    fn test_unknown_material_ranks_lowest() {
        let items = vec![stack("copper_pickaxe", 1), stack("wooden_pickaxe", 1)];
        assert_eq!(best_tool(&items, "_pickaxe").unwrap().name, "wooden_pickaxe");

        let only_unknown = vec![stack("copper_pickaxe", 1)];
        assert_eq!(
            best_tool(&only_unknown, "_pickaxe").unwrap().name,
            "copper_pickaxe"
        );
        assert!(best_tool(&[stack("bone", 3)], "_pickaxe").is_none());
    }

    #[test]
    fn test_golden_outranks_iron() {
        let items = vec![stack("golden_pickaxe", 1), stack("iron_pickaxe", 1)];
        assert_eq!(best_tool(&items, "_pickaxe").unwrap().name, "golden_pickaxe");
    }
}
