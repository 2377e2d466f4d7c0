//! ClearThreats：挖掉外部代理附近的目标节点，之后排队入库

use crate::core::{ActionError, ActionRequest, ActivityName, Scheduler};
use crate::world::{held_count, AgentRef};

impl Scheduler {
    pub async fn clear_threats(&self, agent: AgentRef) -> Result<(), ActionError> {
        if self.ctx().is_emergency() {
            tracing::debug!("Emergency in progress, skipping threat clearing");
            return Ok(());
        }
        let Some(lease) = self.claim(
            ActivityName::Breaking,
            ActionRequest::ClearThreats(agent.clone()),
            false,
        ) else {
            return Ok(());
        };

        let result = self.posture().wrap(self.break_nodes_near(&agent)).await;
        drop(lease);

        let target = &self.config().resources.target_item;
        if held_count(self.world(), target) > 0 {
            tracing::info!(item = %target, "Holding nodes after clearing, queueing storage");
            self.enqueue(ActionRequest::StoreItems);
        }
        result
    }

    async fn break_nodes_near(&self, agent: &AgentRef) -> Result<(), ActionError> {
        let origin = self
            .locate(agent)
            .ok_or_else(|| ActionError::TargetNotVisible(agent.name.clone()))?;
        let settings = &self.config().threats;
        let positions = self.world().find_blocks(
            &self.config().resources.target_item,
            settings.search_radius,
            origin,
            settings.max_nodes,
        );
        tracing::info!(agent = %agent.name, count = positions.len(), "Found nodes near agent");
        if positions.is_empty() {
            return Ok(());
        }

        self.equip_best_tool().await;
        for position in positions {
            let Some(block) = self.target_node_at(position) else {
                continue;
            };
            match self.break_node(&block).await {
                Ok(()) => tracing::info!(position = %position, "Broke node"),
                Err(e) => tracing::warn!(position = %position, error = %e, "Failed to break node"),
            }
        }
        Ok(())
    }
}
