//! LiquidateItems：通过聊天命令打开订单界面，把收获物交付出去
//!
//! 每一步都尽力而为：失败记录后继续；只有两个「界面必须存在」的检查会中止整个流程。

use std::collections::HashMap;
use std::time::Duration;

use crate::core::{ActionError, ActionRequest, ActivityName, Scheduler};
use crate::world::ItemStack;

const SORT_SETTLE: Duration = Duration::from_millis(500);
const CONFIRM_SETTLE: Duration = Duration::from_secs(1);

/// 背包中名为 `name` 的物品按物品 ID 分组，返回数量最多的那一组 `(id, total)`；并列时取先出现的
pub fn dominant_variant(items: &[ItemStack], name: &str) -> Option<(u32, u32)> {
    let mut order: Vec<u32> = Vec::new();
    let mut totals: HashMap<u32, u32> = HashMap::new();
    for item in items.iter().filter(|item| item.name == name) {
        let total = totals.entry(item.id).or_insert_with(|| {
            order.push(item.id);
            0
        });
        *total += item.count;
    }
    order
        .into_iter()
        .map(|id| (id, totals[&id]))
        .fold(None, |best: Option<(u32, u32)>, candidate| match best {
            Some(current) if current.1 >= candidate.1 => Some(current),
            _ => Some(candidate),
        })
}

impl Scheduler {
    pub async fn liquidate_items(&self) -> Result<(), ActionError> {
        if self.ctx().is_emergency() {
            tracing::debug!("Emergency in progress, skipping liquidation");
            return Ok(());
        }
        let harvest = &self.config().resources.harvest_item;
        if dominant_variant(&self.world().items(), harvest).is_none() {
            tracing::info!(item = %harvest, "Nothing to liquidate");
            return Ok(());
        }
        let Some(_lease) =
            self.claim(ActivityName::Selling, ActionRequest::LiquidateItems, false)
        else {
            return Ok(());
        };
        self.posture().wrap(self.liquidate_held()).await
    }

    /// 变现流程本体；调用方负责持有 Selling 活动
    pub(crate) async fn liquidate_held(&self) -> Result<(), ActionError> {
        let world = self.world();
        let harvest = &self.config().resources.harvest_item;
        let settings = &self.config().liquidate;
        let settle = Duration::from_millis(settings.settle_ms);

        let Some((item_id, total)) = dominant_variant(&world.items(), harvest) else {
            tracing::info!(item = %harvest, "Nothing to liquidate");
            return Ok(());
        };
        tracing::info!(item = %harvest, item_id, total, "Starting liquidation");

        world.send_chat(&settings.command);
        tokio::time::sleep(settle).await;
        if world.current_window().is_none() {
            return Err(ActionError::InterfaceMissing("order interface".into()));
        }

        for click in 1..=settings.sort_clicks {
            match world.click_slot(settings.sort_slot, 0, 0).await {
                Ok(()) => tracing::debug!(click, "Sorted orders"),
                Err(e) => tracing::warn!(click, error = %e, "Failed to sort orders"),
            }
            tokio::time::sleep(SORT_SETTLE).await;
        }

        if let Err(e) = world.click_slot(settings.delivery_slot, 0, 0).await {
            tracing::warn!(error = %e, "Failed to select order");
        }
        tokio::time::sleep(settle).await;
        if world.current_window().is_none() {
            return Err(ActionError::InterfaceMissing("delivery interface".into()));
        }

        match world.deposit(item_id, total).await {
            Ok(()) => tracing::info!(total, "Delivered items"),
            Err(e) => tracing::warn!(error = %e, "Delivery failed"),
        }

        world.close_window();
        tokio::time::sleep(settle).await;

        if world.current_window().is_some() {
            match world.click_slot(settings.confirm_slot, 0, 0).await {
                Ok(()) => tracing::info!("Confirmed delivery"),
                Err(e) => tracing::warn!(error = %e, "Failed to confirm delivery"),
            }
            tokio::time::sleep(CONFIRM_SETTLE).await;
            if world.current_window().is_some() {
                world.close_window();
            }
        }
        tracing::info!("Liquidation finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AppConfig;
    use crate::core::orchestrator::scheduler_for;
    use crate::world::mock::{mock_item_id, stack};
    use crate::world::{held_count, MockWorld, WindowView, World};

    fn order_world() -> MockWorld {
        MockWorld::new("me")
            .with_chat_window("/orders bones", WindowView::new(0, "Orders", vec![None; 54]))
            .with_click_transition("Orders", 0, Some(WindowView::new(0, "Deliver", vec![None; 27])))
            .with_close_transition("Deliver", WindowView::new(0, "Confirm", vec![None; 27]))
            .with_click_transition("Confirm", 15, None)
    }

    #[test]
    fn test_dominant_variant_picks_largest_group() {
        let items = vec![
            ItemStack::new(1, "bone", 10),
            ItemStack::new(2, "bone", 30),
            ItemStack::new(1, "bone", 15),
            ItemStack::new(3, "arrow", 64),
        ];
        assert_eq!(dominant_variant(&items, "bone"), Some((2, 30)));
        assert_eq!(dominant_variant(&items, "stick"), None);
    }

    #[test]
    fn test_dominant_variant_tie_keeps_first() {
        let items = vec![ItemStack::new(7, "bone", 5), ItemStack::new(4, "bone", 5)];
        assert_eq!(dominant_variant(&items, "bone"), Some((7, 5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidate_full_flow() {
        let world = Arc::new(order_world().with_item("bone", 100));
        let scheduler = scheduler_for(&world, AppConfig::default());

        scheduler.liquidate_items().await.unwrap();

        assert_eq!(world.chat_log(), vec!["/orders bones".to_string()]);
        assert_eq!(held_count(world.as_ref(), "bone"), 0);
        assert_eq!(
            world.deposits(),
            vec![("Deliver".to_string(), mock_item_id("bone"), 100)]
        );
        let sorts = world.calls().iter().filter(|c| *c == "click:47").count();
        assert_eq!(sorts, 3);
        assert!(world.calls().contains(&"click:15".to_string()));
        assert!(world.current_window().is_none());
        assert!(scheduler.ctx().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidate_noop_without_items() {
        let world = Arc::new(order_world());
        let scheduler = scheduler_for(&world, AppConfig::default());

        scheduler.liquidate_items().await.unwrap();
        assert!(world.chat_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidate_aborts_without_order_interface() {
        let world = Arc::new(MockWorld::new("me").with_item("bone", 3));
        let scheduler = scheduler_for(&world, AppConfig::default());

        let err = scheduler.liquidate_items().await.unwrap_err();
        assert!(matches!(err, ActionError::InterfaceMissing(_)));
        assert_eq!(held_count(world.as_ref(), "bone"), 3);
        assert!(scheduler.ctx().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidate_aborts_without_delivery_interface() {
        let world = Arc::new(
            MockWorld::new("me")
                .with_item("bone", 3)
                .with_chat_window("/orders bones", WindowView::new(0, "Orders", vec![None; 54]))
                .with_click_transition("Orders", 0, None),
        );
        let scheduler = scheduler_for(&world, AppConfig::default());

        let err = scheduler.liquidate_items().await.unwrap_err();
        assert!(matches!(err, ActionError::InterfaceMissing(_)));
        assert!(world.deposits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liquidate_uses_dominant_variant_only() {
        let world = Arc::new(order_world().with_item("bone", 20));
        let scheduler = scheduler_for(&world, AppConfig::default());
        assert_eq!(
            dominant_variant(&world.items(), "bone"),
            Some((stack("bone", 1).id, 20))
        );
        scheduler.liquidate_items().await.unwrap();
        assert_eq!(world.deposits().len(), 1);
    }
}
