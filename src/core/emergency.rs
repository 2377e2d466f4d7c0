//! 哨兵与紧急撤离
//!
//! 哨兵命中后，同步完成：置位 EmergencyFlag、清空队列、回到 Idle、停止周期触发器；
//! 之后才启动撤离任务（拆除附近节点 → 强制入库 → 主动结束会话）。
//! 撤离过程中的任何错误或 panic 都在顶层捕获，会话仍然会被主动结束。

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

use crate::config::EmergencyResponse;
use crate::core::{ActionError, ActionRequest, Scheduler, ShutdownReason};
use crate::world::{AgentRef, World};

const SWEEP_PAUSE: Duration = Duration::from_secs(1);
const BREAK_SETTLE: Duration = Duration::from_millis(500);

/// 探测半径内最近的其它代理（排除自己、排除不可见的）
pub fn find_intruder(world: &dyn World, radius: f64) -> Option<AgentRef> {
    let me = world.username();
    let here = world.position();
    world
        .players()
        .into_values()
        .filter(|agent| agent.name != me)
        .filter_map(|agent| {
            let distance = here.distance_to(&agent.position?);
            (distance <= radius).then_some((distance, agent))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)))
        .map(|(_, agent)| agent)
}

impl Scheduler {
    /// 哨兵检查；命中时返回 true
    pub fn sentinel_check(&self) -> bool {
        if self.ctx().is_emergency() || self.ctx().is_shutdown() {
            return false;
        }
        let radius = self.config().emergency.detection_radius;
        let Some(agent) = find_intruder(self.world(), radius) else {
            return false;
        };

        match self.config().emergency.response {
            EmergencyResponse::Evacuate => {
                self.trigger_emergency(agent);
            }
            EmergencyResponse::ClearThreats => {
                tracing::warn!(agent = %agent.name, "Agent detected, queueing threat clearing");
                self.enqueue(ActionRequest::ClearThreats(agent));
            }
        }
        true
    }

    /// 进入紧急模式；只有第一次调用生效
    pub fn trigger_emergency(&self, agent: AgentRef) -> bool {
        if !self.ctx().raise_emergency() {
            return false;
        }
        tracing::warn!(agent = %agent.name, "Agent detected, initiating emergency protocol");

        let dropped = self.ctx().queue().clear();
        if dropped > 0 {
            tracing::info!(dropped, "Cleared work queue");
        }
        self.ctx().clear_activity();
        self.triggers().cancel();

        tokio::spawn(EmergencyController::new(self.clone()).run(agent));
        true
    }
}

/// 紧急撤离流程
pub struct EmergencyController {
    scheduler: Scheduler,
}

impl EmergencyController {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// 会话中途断开时放弃剩余步骤，但仍然置位 ShutdownFlag，不再重连
    pub async fn run(self, agent: AgentRef) {
        let session = self.scheduler.session().clone();
        let outcome = tokio::select! {
            biased;
            _ = session.cancelled() => None,
            outcome = AssertUnwindSafe(self.evacuate(&agent)).catch_unwind() => Some(outcome),
        };
        match outcome {
            Some(Ok(())) => tracing::info!("Emergency sequence complete"),
            Some(Err(_)) => tracing::error!("Emergency sequence panicked"),
            None => tracing::warn!("Session ended during emergency sequence"),
        }

        self.scheduler
            .ctx()
            .shutdown_manager()
            .shutdown(ShutdownReason::Emergency(agent.name.clone()));
        if !session.is_cancelled() {
            self.scheduler.world().quit();
        }
    }

    async fn evacuate(&self, agent: &AgentRef) {
        tracing::info!(agent = %agent.name, "Starting emergency sequence");

        if let Err(e) = self.sweep_nodes(agent).await {
            tracing::error!(error = %e, "Emergency sweep failed");
        }
        if let Err(e) = self.scheduler.store_items(true).await {
            tracing::error!(error = %e, "Emergency storage failed");
        }
    }

    /// 在代理附近反复扫描并挖掉目标节点，直到没有剩余或达到轮数上限
    async fn sweep_nodes(&self, agent: &AgentRef) -> Result<(), ActionError> {
        let s = &self.scheduler;
        s.posture()
            .wrap(async {
                s.equip_best_tool().await;
                let origin = s
                    .locate(agent)
                    .ok_or_else(|| ActionError::TargetNotVisible(agent.name.clone()))?;

                let max_sweeps = s.config().emergency.max_sweeps;
                let target = &s.config().resources.target_item;
                let threats = &s.config().threats;
                for sweep in 1..=max_sweeps {
                    let positions = s.world().find_blocks(
                        target,
                        threats.search_radius,
                        origin,
                        threats.max_nodes,
                    );
                    if positions.is_empty() {
                        tracing::info!(sweep, "No nodes left near agent");
                        break;
                    }
                    tracing::info!(sweep, max_sweeps, count = positions.len(), "Sweeping nodes");

                    for position in positions {
                        let Some(block) = s.target_node_at(position) else {
                            continue;
                        };
                        match s.break_node(&block).await {
                            Ok(()) => {
                                tokio::time::sleep(BREAK_SETTLE).await;
                                if s.target_node_at(position).is_some() {
                                    tracing::warn!(
                                        position = %position,
                                        "Node still present after break"
                                    );
                                } else {
                                    tracing::info!(position = %position, "Broke node");
                                }
                            }
                            Err(e) => {
                                tracing::error!(position = %position, error = %e, "Break failed")
                            }
                        }
                    }
                    tokio::time::sleep(SWEEP_PAUSE).await;
                }
                Ok::<(), ActionError>(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::AppConfig;
    use crate::core::orchestrator::scheduler_for;
    use crate::core::ActionKind;
    use crate::world::{held_count, MockWorld, Position, Vec3};

    #[test]
    fn test_find_intruder_excludes_self_and_far_agents() {
        let world = MockWorld::new("me")
            .with_player("far", Vec3::new(900.0, 64.0, 0.0))
            .with_player("near", Vec3::new(40.0, 64.0, 0.0))
            .with_player("nearer", Vec3::new(10.0, 64.0, 0.0));
        assert_eq!(find_intruder(&world, 500.0).unwrap().name, "nearer");

        let alone = MockWorld::new("me");
        assert!(find_intruder(&alone, 500.0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_clears_state_before_first_await() {
        let world = Arc::new(MockWorld::new("me"));
        let scheduler = scheduler_for(&world, AppConfig::default());
        scheduler.ctx().set_activity(crate::core::ActivityName::Selling);
        scheduler.ctx().queue().push(ActionRequest::StoreItems);
        scheduler.ctx().queue().push(ActionRequest::LiquidateItems);
        world.add_player("intruder", Vec3::new(20.0, 64.0, 0.0));

        assert!(scheduler.sentinel_check());

        // 没有任何 await：状态已经同步清理
        assert!(scheduler.ctx().is_emergency());
        assert!(scheduler.ctx().queue().is_empty());
        assert!(scheduler.ctx().is_idle());
        assert!(scheduler.triggers().is_cancelled());
        assert!(!scheduler.enqueue(ActionRequest::StoreItems));
        assert!(!scheduler.sentinel_check());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_sweeps_stores_and_quits() {
        let world = Arc::new(
            MockWorld::new("me")
                .with_block("spawner", Position::new(5, 64, 0))
                .with_block("spawner", Position::new(6, 64, 0))
                .with_block("ender_chest", Position::new(0, 64, 2))
                .with_item("netherite_pickaxe", 1),
        );
        let scheduler = scheduler_for(&world, AppConfig::default());
        world.add_player("intruder", Vec3::new(5.0, 64.0, 0.0));

        assert!(scheduler.sentinel_check());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!world.has_block(Position::new(5, 64, 0)));
        assert!(!world.has_block(Position::new(6, 64, 0)));
        assert_eq!(held_count(world.as_ref(), "spawner"), 0);
        assert_eq!(world.deposits().len(), 1);
        assert!(scheduler.ctx().is_shutdown());
        assert!(world.has_quit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_quits_even_when_everything_fails() {
        let world = Arc::new(
            MockWorld::new("me")
                .with_block("spawner", Position::new(5, 64, 0))
                .with_item("spawner", 2),
        );
        world.set_fail_break(true);
        let scheduler = scheduler_for(&world, AppConfig::default());

        assert!(scheduler.trigger_emergency(AgentRef {
            name: "intruder".into(),
            position: Some(Vec3::new(5.0, 64.0, 0.0)),
        }));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(world.has_block(Position::new(5, 64, 0)));
        assert!(scheduler.ctx().is_shutdown());
        assert!(world.has_quit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_threats_response_keeps_session() {
        let world = Arc::new(MockWorld::new("me"));
        let mut config = AppConfig::default();
        config.emergency.response = EmergencyResponse::ClearThreats;
        let scheduler = scheduler_for(&world, config);
        scheduler.ctx().set_activity(crate::core::ActivityName::Selling);
        world.add_player("intruder", Vec3::new(20.0, 64.0, 0.0));

        assert!(scheduler.sentinel_check());
        assert!(!scheduler.ctx().is_emergency());
        assert_eq!(scheduler.ctx().queue().kinds(), vec![ActionKind::ClearThreats]);
        assert!(!scheduler.triggers().is_cancelled());
    }
}
