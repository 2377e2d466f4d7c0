//! StoreItems：把背包里的目标物品存进最近的存储容器
//!
//! 最多尝试 `max_attempts` 次，每次失败后改用备用容器种类；全部失败时放弃，不报错。

use std::time::Duration;

use crate::core::{ActionError, ActionRequest, ActivityName, Scheduler};
use crate::world::{BlockRef, WorldError};

const APPROACH_SETTLE: Duration = Duration::from_millis(500);

impl Scheduler {
    /// `forced` 用于紧急撤离：跳过紧急检查与忙碌检查，直接抢占活动槽
    pub async fn store_items(&self, forced: bool) -> Result<(), ActionError> {
        if !forced && self.ctx().is_emergency() {
            tracing::debug!("Emergency in progress, skipping storage");
            return Ok(());
        }
        let target = &self.config().resources.target_item;
        if !self.world().items().iter().any(|item| &item.name == target) {
            tracing::info!(item = %target, "Nothing to store");
            return Ok(());
        }
        let Some(_lease) = self.claim(ActivityName::StoringItems, ActionRequest::StoreItems, forced)
        else {
            return Ok(());
        };
        self.posture().wrap(self.store_held_items()).await
    }

    async fn store_held_items(&self) -> Result<(), ActionError> {
        let resources = &self.config().resources;
        let settings = &self.config().store;

        let mut container = self
            .world()
            .find_nearest_block(&resources.storage_kinds, settings.search_radius)
            .ok_or(ActionError::NoContainer(settings.search_radius))?;

        for attempt in 1..=settings.max_attempts {
            tracing::info!(
                attempt,
                max_attempts = settings.max_attempts,
                position = %container.position,
                "Accessing storage container"
            );
            match self.deposit_into(&container).await {
                Ok(stored) => {
                    tracing::info!(stored, "Inventory emptied into storage");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Storage attempt failed");
                    self.world().close_window();
                    if attempt == settings.max_attempts {
                        break;
                    }
                    let alternate = self.world().find_nearest_block(
                        &resources.fallback_storage_kinds,
                        settings.search_radius,
                    );
                    match alternate {
                        Some(alternate) => container = alternate,
                        None => {
                            tracing::warn!("No alternate container found");
                            break;
                        }
                    }
                }
            }
        }
        tracing::warn!("Giving up on storage for now");
        Ok(())
    }

    /// 打开容器并放入全部目标物品，返回存入数量
    async fn deposit_into(&self, container: &BlockRef) -> Result<u32, WorldError> {
        let world = self.world();
        let target = &self.config().resources.target_item;
        let center = container.position.center();

        let distance = world.position().distance_to(&center);
        if distance > self.config().store.interaction_range {
            tracing::info!(distance, "Moving closer to container");
            world.look_at(center).await?;
            tokio::time::sleep(APPROACH_SETTLE).await;
        }
        world.look_at(center).await?;
        world.open_container(container).await?;

        let mut stored = 0;
        for stack in world.items().into_iter().filter(|item| &item.name == target) {
            world.deposit(stack.id, stack.count).await?;
            stored += stack.count;
        }
        world.close_window();
        Ok(stored)
    }
}
