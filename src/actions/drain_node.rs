//! DrainNode：打开节点界面，取出收获物，执行界面内的出售确认，然后关闭
//!
//! 交互被建模为显式状态机：AwaitingInterface → Interacting ⇄ Confirming → Closed。
//! 界面出现通过订阅窗口事件并带超时等待，而不是轮询。

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use crate::core::orchestrator::ActivityLease;
use crate::core::{ActionError, ActionRequest, ActivityName, Scheduler};
use crate::world::{held_count, BlockRef, ItemStack, WindowView, WorldError};

const AIM_SETTLE: Duration = Duration::from_millis(500);
const CLICK_SETTLE: Duration = Duration::from_millis(300);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const REVEAL_SETTLE: Duration = Duration::from_secs(1);
const WITHDRAW_SETTLE: Duration = Duration::from_millis(500);
const SLOT_SETTLE: Duration = Duration::from_millis(200);
const SELL_SETTLE: Duration = Duration::from_millis(1500);
const CONFIRM_SETTLE: Duration = Duration::from_secs(1);
const PASS_SETTLE: Duration = Duration::from_millis(500);

/// 节点界面交互阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeInteraction {
    AwaitingInterface,
    Interacting,
    Confirming,
    Closed,
}

impl Scheduler {
    /// 抽取一个节点，返回取出的收获物数量
    pub async fn drain_node(&self, node: BlockRef) -> Result<u32, ActionError> {
        let target = &self.config().resources.target_item;
        if &node.kind != target {
            tracing::warn!(
                kind = %node.kind,
                position = %node.position,
                "Not a target node, ignoring"
            );
            return Ok(0);
        }
        if self.ctx().is_emergency() {
            tracing::debug!("Emergency in progress, skipping drain");
            return Ok(0);
        }
        let Some(mut lease) =
            self.claim(ActivityName::Emptying, ActionRequest::DrainNode(node.clone()), false)
        else {
            return Ok(0);
        };
        self.posture()
            .wrap(self.drain_and_sell(&node, &mut lease))
            .await
    }

    async fn drain_and_sell(
        &self,
        node: &BlockRef,
        lease: &mut ActivityLease,
    ) -> Result<u32, ActionError> {
        let collected = self.drain_interface(node).await?;
        if collected == 0 {
            return Ok(0);
        }
        tracing::info!(collected, "Node drained");

        if self.ctx().is_emergency() {
            tracing::info!("Emergency in progress, not liquidating");
            return Ok(collected);
        }
        let harvest = &self.config().resources.harvest_item;
        let held = held_count(self.world(), harvest);
        if held < self.config().drain.min_to_liquidate {
            return Ok(collected);
        }

        tracing::info!(held, "Liquidating immediately after drain");
        if lease.hand_off(ActivityName::Selling) {
            if let Err(e) = self.liquidate_held().await {
                tracing::warn!(error = %e, "Liquidation after drain failed");
            }
        } else {
            self.enqueue(ActionRequest::LiquidateItems);
        }
        Ok(collected)
    }

    async fn drain_interface(&self, node: &BlockRef) -> Result<u32, ActionError> {
        let world = self.world();
        let settings = &self.config().drain;

        world.look_at(node.position.center()).await?;
        tokio::time::sleep(AIM_SETTLE).await;

        match world.block_at_cursor(settings.cursor_range) {
            Some(viewed) if viewed.position == node.position => {}
            viewed => {
                let found = viewed.map_or_else(
                    || "nothing".to_string(),
                    |block| format!("{} at {}", block.kind, block.position),
                );
                return Err(ActionError::TargetMismatch {
                    expected: node.position,
                    found,
                });
            }
        }

        let mut opened = world.subscribe_windows();
        if !self.activate_node(node).await {
            return Err(ActionError::InterfaceMissing("node refused every activation".into()));
        }

        let mut phase = NodeInteraction::AwaitingInterface;
        let mut collected = 0;
        let mut passes = 0;
        while phase != NodeInteraction::Closed {
            tracing::debug!(?phase, passes, collected, "Node interaction");
            phase = match phase {
                NodeInteraction::AwaitingInterface => {
                    let wait = Duration::from_millis(settings.interface_timeout_ms);
                    let view = match timeout(wait, opened.recv()).await {
                        Ok(Ok(view)) => Some(view),
                        Ok(Err(RecvError::Lagged(_))) => world.current_window(),
                        Ok(Err(RecvError::Closed)) | Err(_) => None,
                    };
                    let Some(view) = view else {
                        return Err(ActionError::InterfaceMissing("node interface".into()));
                    };
                    tracing::info!(title = %view.title, "Node interface opened");
                    self.reveal_contents(&view).await;
                    NodeInteraction::Interacting
                }
                NodeInteraction::Interacting => {
                    passes += 1;
                    match self.withdraw_pass(passes).await {
                        Some(taken) => {
                            collected += taken;
                            NodeInteraction::Confirming
                        }
                        None => NodeInteraction::Closed,
                    }
                }
                NodeInteraction::Confirming => {
                    self.confirm_node_sale().await;
                    tokio::time::sleep(PASS_SETTLE).await;
                    if passes < settings.max_passes && world.current_window().is_some() {
                        NodeInteraction::Interacting
                    } else {
                        NodeInteraction::Closed
                    }
                }
                NodeInteraction::Closed => NodeInteraction::Closed,
            };
        }

        if world.current_window().is_some() {
            world.close_window();
        }
        Ok(collected)
    }

    /// 激活节点直到成功或用完次数
    async fn activate_node(&self, node: &BlockRef) -> bool {
        let world = self.world();
        let attempts = self.config().drain.click_attempts;
        for attempt in 1..=attempts {
            let result: Result<(), WorldError> = async {
                world.look_at(node.position.center()).await?;
                tokio::time::sleep(CLICK_SETTLE).await;
                world.activate_block(node).await
            }
            .await;
            match result {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Node activation failed");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
        false
    }

    /// 部分节点界面需要先点开内容页
    async fn reveal_contents(&self, view: &WindowView) {
        let slot = self.config().drain.reveal_slot;
        if view.slot(slot).is_none() {
            return;
        }
        match self.world().click_slot(slot, 0, 0).await {
            Ok(()) => tracing::info!(slot, "Opened node contents"),
            Err(e) => tracing::warn!(slot, error = %e, "Failed to open node contents"),
        }
        tokio::time::sleep(REVEAL_SETTLE).await;
    }

    /// 一轮取出；没有可取的物品或背包已满时返回 None
    async fn withdraw_pass(&self, pass: u32) -> Option<u32> {
        let world = self.world();
        let settings = &self.config().drain;
        let harvest = &self.config().resources.harvest_item;

        let view = world.current_window()?;
        let slots: Vec<(usize, ItemStack)> = view
            .slots
            .iter()
            .take(settings.container_slots)
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .filter(|item| &item.name == harvest)
                    .map(|item| (index, item.clone()))
            })
            .collect();
        if slots.is_empty() {
            tracing::info!(pass, "No harvest left in node");
            return None;
        }

        let free = world.empty_slot_count();
        if free == 0 {
            tracing::warn!(pass, "Inventory full, stopping drain");
            return None;
        }

        let available: u32 = slots.iter().map(|(_, item)| item.count).sum();
        let amount = available.min(free.saturating_mul(settings.slot_capacity));
        let item_id = slots[0].1.id;
        tracing::info!(pass, available, amount, "Withdrawing harvest");

        match world.withdraw(item_id, amount).await {
            Ok(()) => {
                tokio::time::sleep(WITHDRAW_SETTLE).await;
                Some(amount)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bulk withdraw failed, taking slots one by one");
                let mut taken = 0;
                for (index, item) in slots {
                    match world.click_slot(index, 0, 1).await {
                        Ok(()) => {
                            taken += item.count;
                            tokio::time::sleep(SLOT_SETTLE).await;
                        }
                        Err(e) => tracing::warn!(slot = index, error = %e, "Slot withdraw failed"),
                    }
                    if world.empty_slot_count() == 0 {
                        tracing::warn!("Inventory full");
                        break;
                    }
                }
                Some(taken)
            }
        }
    }

    /// 点击界面内的出售入口并确认；每一步失败都只记录
    async fn confirm_node_sale(&self) {
        let world = self.world();
        let settings = &self.config().drain;

        if let Err(e) = world.click_slot(settings.sell_slot, 0, 0).await {
            tracing::warn!(slot = settings.sell_slot, error = %e, "Failed to open sale view");
            return;
        }
        tokio::time::sleep(SELL_SETTLE).await;

        if world.current_window().is_none() {
            tracing::warn!("Sale view did not open");
            return;
        }
        match world.click_slot(settings.confirm_slot, 0, 0).await {
            Ok(()) => tracing::info!("Confirmed node sale"),
            Err(e) => tracing::warn!(
                slot = settings.confirm_slot,
                error = %e,
                "Failed to confirm sale"
            ),
        }
        tokio::time::sleep(CONFIRM_SETTLE).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::AppConfig;
    use crate::core::orchestrator::scheduler_for;
    use crate::core::ActionError;
    use crate::world::mock::stack;
    use crate::world::{held_count, BlockRef, MockWorld, Position, WindowView, World};

    const NODE: Position = Position::new(1, 64, 1);

    fn node() -> BlockRef {
        BlockRef::new("spawner", NODE)
    }

    /// 节点界面：槽位 0..n 放收获物，53 进入出售页，出售页 15 确认后关闭
    fn scripted_world(harvest_slots: usize) -> MockWorld {
        let mut slots = vec![None; 54];
        for slot in slots.iter_mut().take(harvest_slots) {
            *slot = Some(stack("bone", 64));
        }
        MockWorld::new("me")
            .with_block("spawner", NODE)
            .with_block_window("spawner", WindowView::new(0, "Spawner", slots))
            .with_click_transition("Spawner", 53, Some(WindowView::new(0, "Sell", vec![None; 27])))
            .with_click_transition("Sell", 15, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_collects_and_confirms() {
        let world = Arc::new(scripted_world(3));
        let mut config = AppConfig::default();
        // 不触发后续变现，单独验证抽取
        config.drain.min_to_liquidate = 10_000;
        let scheduler = scheduler_for(&world, config);

        let collected = scheduler.drain_node(node()).await.unwrap();

        assert_eq!(collected, 192);
        assert_eq!(held_count(world.as_ref(), "bone"), 192);
        let calls = world.calls();
        assert!(calls.contains(&"click:53".to_string()));
        assert!(calls.contains(&"click:15".to_string()));
        assert!(world.current_window().is_none());
        assert!(scheduler.ctx().is_idle());
        assert_eq!(scheduler.posture().active_tight_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_rejects_non_target_block() {
        let world = Arc::new(scripted_world(1));
        let scheduler = scheduler_for(&world, AppConfig::default());

        let collected = scheduler
            .drain_node(BlockRef::new("chest", NODE))
            .await
            .unwrap();
        assert_eq!(collected, 0);
        assert!(world.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_on_cursor_mismatch() {
        let stone = BlockRef::new("stone", Position::new(9, 64, 9));
        let world = Arc::new(scripted_world(1).with_cursor_override(Some(stone)));
        let scheduler = scheduler_for(&world, AppConfig::default());

        let err = scheduler.drain_node(node()).await.unwrap_err();
        assert!(matches!(err, ActionError::TargetMismatch { .. }));
        assert!(!world.calls().iter().any(|c| c.starts_with("activate:")));
        assert!(scheduler.ctx().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_when_interface_never_opens() {
        let world = Arc::new(MockWorld::new("me").with_block("spawner", NODE));
        let scheduler = scheduler_for(&world, AppConfig::default());

        let err = scheduler.drain_node(node()).await.unwrap_err();
        assert!(matches!(err, ActionError::InterfaceMissing(_)));
        assert!(scheduler.ctx().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_retries_activation() {
        let world = Arc::new(scripted_world(1));
        world.fail_next_activations(2);
        let mut config = AppConfig::default();
        config.drain.min_to_liquidate = 10_000;
        let scheduler = scheduler_for(&world, config);

        let collected = scheduler.drain_node(node()).await.unwrap();
        assert_eq!(collected, 64);
        let activations = world.calls().iter().filter(|c| c.starts_with("activate:")).count();
        assert_eq!(activations, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_activation_attempts() {
        let world = Arc::new(scripted_world(1));
        world.fail_next_activations(3);
        let scheduler = scheduler_for(&world, AppConfig::default());

        let err = scheduler.drain_node(node()).await.unwrap_err();
        assert!(matches!(err, ActionError::InterfaceMissing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_falls_back_to_slot_clicks() {
        let world = Arc::new(scripted_world(2));
        world.set_fail_withdraw(true);
        let mut config = AppConfig::default();
        config.drain.min_to_liquidate = 10_000;
        let scheduler = scheduler_for(&world, config);

        let collected = scheduler.drain_node(node()).await.unwrap();
        assert_eq!(collected, 128);
        assert!(world.calls().contains(&"click:0".to_string()));
        assert!(world.calls().contains(&"click:1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_reveals_contents_first() {
        let mut front = vec![None; 27];
        front[11] = Some(stack("paper", 1));
        let mut contents = vec![None; 54];
        contents[0] = Some(stack("bone", 10));
        let world = Arc::new(
            MockWorld::new("me")
                .with_block("spawner", NODE)
                .with_block_window("spawner", WindowView::new(0, "Front", front))
                .with_click_transition("Front", 11, Some(WindowView::new(0, "Spawner", contents)))
                .with_click_transition("Spawner", 53, None),
        );
        let mut config = AppConfig::default();
        config.drain.min_to_liquidate = 10_000;
        let scheduler = scheduler_for(&world, config);

        let collected = scheduler.drain_node(node()).await.unwrap();
        assert_eq!(collected, 10);
        assert_eq!(world.calls().iter().filter(|c| *c == "click:11").count(), 1);
    }
}
