//! 调度器：工作队列排空、动作分发与周期触发器
//!
//! 每个 Session 创建一个 Scheduler（持有该会话的 World 句柄与姿态守护），共享进程级的 SchedulerContext。
//! 排空是显式循环：队首在 `enqueue`/`try_drain` 中同步弹出，随后在单独任务里逐个执行，直到不再满足 Idle/非紧急。
//! Scheduler 派生的所有任务都绑定会话令牌：会话结束后它们在下一个挂起点被丢弃，不再触碰旧的 World。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    ActionError, ActionKind, ActionRequest, ActivityName, PostureGuard, SchedulerContext,
};
use crate::world::{held_count, World};

/// 处理器持有的活动租约：drop 时只释放自己那次激活
pub(crate) struct ActivityLease {
    ctx: Arc<SchedulerContext>,
    generation: u64,
}

impl ActivityLease {
    /// 把活动槽转交给另一个活动（重新计时看门狗）；租约已失效时返回 false
    pub(crate) fn hand_off(&mut self, name: ActivityName) -> bool {
        match self.ctx.hand_off_activity(self.generation, name) {
            Some(generation) => {
                self.generation = generation;
                true
            }
            None => false,
        }
    }
}

impl Drop for ActivityLease {
    fn drop(&mut self) {
        self.ctx.release_activity(self.generation);
    }
}

/// 单会话调度器
#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<SchedulerContext>,
    world: Arc<dyn World>,
    posture: PostureGuard,
    config: Arc<AppConfig>,
    session: CancellationToken,
    /// 会话令牌的子令牌；紧急模式只停触发器
    triggers: CancellationToken,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        world: Arc<dyn World>,
        posture: PostureGuard,
        config: Arc<AppConfig>,
        session: CancellationToken,
    ) -> Self {
        let triggers = session.child_token();
        Self {
            ctx,
            world,
            posture,
            config,
            session,
            triggers,
        }
    }

    pub fn ctx(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    pub fn world(&self) -> &dyn World {
        self.world.as_ref()
    }

    pub fn posture(&self) -> &PostureGuard {
        &self.posture
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn triggers(&self) -> &CancellationToken {
        &self.triggers
    }

    pub(crate) fn session(&self) -> &CancellationToken {
        &self.session
    }

    /// 派生一个随会话结束而被丢弃的任务
    fn spawn_scoped<Fut>(&self, task: &'static str, work: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = session.cancelled() => {
                    tracing::debug!(task, "Session ended, dropping scheduler task");
                }
                _ = work => {}
            }
        });
    }

    // ---- 队列 ----

    /// 入队；重复或紧急模式下拒绝。入队成功后立即尝试排空。
    pub fn enqueue(&self, request: ActionRequest) -> bool {
        let kind = request.kind();
        if self.ctx.is_emergency() {
            tracing::info!(action = %kind, "Emergency in progress, dropping action");
            return false;
        }
        let queued = {
            let mut queue = self.ctx.queue();
            queue.push(request).then(|| queue.len())
        };
        let Some(len) = queued else {
            tracing::info!(action = %kind, "Skipping duplicate action");
            return false;
        };
        tracing::info!(action = %kind, queued = len, "Added action to queue");
        self.try_drain();
        true
    }

    /// Idle、非紧急且没有排空在进行时，弹出队首并启动排空循环
    pub fn try_drain(&self) {
        if self.session.is_cancelled() {
            return;
        }
        if let Some(first) = self.ctx.begin_drain() {
            self.spawn_scoped("drain", self.clone().drain_from(first));
        }
    }

    /// 会话结束时整个循环被丢弃，draining 由会话清理释放
    async fn drain_from(self, first: ActionRequest) {
        let mut next = Some(first);
        while let Some(request) = next {
            let kind = request.kind();
            self.dispatch(request).await;

            if kind == ActionKind::LiquidateItems {
                let purged = self.ctx.queue().purge(ActionKind::LiquidateItems);
                if purged > 0 {
                    tracing::info!(
                        purged,
                        "Removed redundant liquidate actions after completing one"
                    );
                }
            }
            next = self.ctx.continue_drain();
        }
    }

    /// 执行一个动作；成功与失败都视为已处理，输出审计日志
    pub async fn dispatch(&self, request: ActionRequest) {
        let kind = request.kind();
        tracing::info!(action = %kind, "Processing action");
        let start = Instant::now();

        let handler = async move {
            match request {
                ActionRequest::StoreItems => self.store_items(false).await,
                ActionRequest::DrainNode(node) => self.drain_node(node).await.map(|_| ()),
                ActionRequest::LiquidateItems => self.liquidate_items().await,
                ActionRequest::ClearThreats(agent) => self.clear_threats(agent).await,
            }
        };
        let (outcome, error) = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Ok(())) => ("ok", None),
            Ok(Err(e @ ActionError::World(_))) => ("world_error", Some(e)),
            Ok(Err(e)) => ("aborted", Some(e)),
            Err(_) => ("panicked", None),
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": kind,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit, "action");

        match error {
            Some(e) => tracing::warn!(action = %kind, error = %e, "Action aborted"),
            None if outcome == "panicked" => tracing::error!(action = %kind, "Action panicked"),
            None => {}
        }
    }

    /// 直接调用（不经队列）；结束后尝试排空期间积压的工作
    pub async fn run_direct(&self, request: ActionRequest) {
        tokio::select! {
            biased;
            _ = self.session.cancelled() => return,
            _ = self.dispatch(request) => {}
        }
        self.try_drain();
    }

    /// 获取活动槽：忙于其它活动时把自己放回队列并返回 None；`forced` 时直接抢占
    pub(crate) fn claim(
        &self,
        name: ActivityName,
        request: ActionRequest,
        forced: bool,
    ) -> Option<ActivityLease> {
        if !forced {
            if let Some(current) = self.ctx.current_activity().filter(|c| *c != name) {
                tracing::info!(
                    busy_with = %current,
                    action = %request.kind(),
                    "Currently busy, adding to queue"
                );
                self.enqueue(request);
                return None;
            }
        }
        let generation = self.ctx.set_activity(name);
        Some(ActivityLease {
            ctx: Arc::clone(&self.ctx),
            generation,
        })
    }

    // ---- 周期触发器 ----

    /// 启动节点扫描、背包扫描、空闲检查与哨兵；会话结束或进入紧急模式时停止
    pub fn start_triggers(&self) {
        let triggers = &self.config.triggers;
        self.spawn_periodic(
            "node_scan",
            Duration::from_secs(triggers.node_scan_secs),
            |s| async move { s.check_nodes().await },
        );
        self.spawn_periodic(
            "inventory_scan",
            Duration::from_secs(triggers.inventory_scan_secs),
            |s| async move { s.check_inventory().await },
        );
        self.spawn_periodic(
            "idle_check",
            Duration::from_secs(triggers.idle_check_secs),
            |s| async move { s.try_drain() },
        );
        self.spawn_periodic(
            "sentinel",
            Duration::from_millis(triggers.sentinel_ms),
            |s| async move {
                s.sentinel_check();
            },
        );
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(Scheduler) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = self.clone();
        let token = self.triggers.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(trigger = name, "Trigger stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        // 紧急模式停掉的只是触发器，已开始的处理器跑到会话结束为止
                        scheduler.spawn_scoped(name, tick(scheduler.clone()));
                    }
                }
            }
        });
    }

    /// 附近有目标节点且空闲时直接抽取
    pub async fn check_nodes(&self) {
        if self.ctx.is_emergency() {
            return;
        }
        if let Some(current) = self.ctx.current_activity() {
            tracing::debug!(activity = %current, "Skipping node scan, currently busy");
            return;
        }
        let resources = &self.config.resources;
        let Some(node) = self.world.find_nearest_block(
            std::slice::from_ref(&resources.target_item),
            self.config.drain.scan_radius,
        ) else {
            return;
        };
        tracing::info!(position = %node.position, "Found nearby node, draining");
        self.run_direct(ActionRequest::DrainNode(node)).await;
    }

    /// 背包里有可变现物品时直接变现
    pub async fn check_inventory(&self) {
        if self.ctx.is_emergency() {
            return;
        }
        let harvest = &self.config.resources.harvest_item;
        if held_count(self.world.as_ref(), harvest) > 0 {
            tracing::info!(item = %harvest, "Liquidatable items held, selling");
            self.run_direct(ActionRequest::LiquidateItems).await;
        }
    }
}

#[cfg(test)]
pub(crate) fn scheduler_for(
    world: &Arc<crate::world::MockWorld>,
    config: AppConfig,
) -> Scheduler {
    let ctx = SchedulerContext::new(
        Duration::from_secs(config.activity.watchdog_secs),
        crate::core::ShutdownManager::new(),
    );
    let world: Arc<dyn World> = world.clone();
    let posture = PostureGuard::new(Arc::clone(&world), &config.posture);
    Scheduler::new(ctx, world, posture, Arc::new(config), CancellationToken::new())
}
