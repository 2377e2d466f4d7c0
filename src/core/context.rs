//! 调度上下文：ActivityState、WorkQueue、EmergencyFlag 与 ShutdownFlag 的唯一持有者
//!
//! 生命周期与进程相同，跨重连复用；World 句柄不在这里，它属于单个 Session。
//! 所有锁都只在同步代码段内持有，不跨越 await。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::{
    ActionRequest, ActivityName, ActivityState, SchedulerSnapshot, ShutdownManager, WorkQueue,
};

pub struct SchedulerContext {
    activity: Mutex<ActivityState>,
    queue: Mutex<WorkQueue>,
    emergency: AtomicBool,
    shutdown: ShutdownManager,
    watchdog_timeout: Duration,
    watchdog_faults: AtomicU64,
}

impl SchedulerContext {
    pub fn new(watchdog_timeout: Duration, shutdown: ShutdownManager) -> Arc<Self> {
        Arc::new(Self {
            activity: Mutex::new(ActivityState::default()),
            queue: Mutex::new(WorkQueue::new()),
            emergency: AtomicBool::new(false),
            shutdown,
            watchdog_timeout,
            watchdog_faults: AtomicU64::new(0),
        })
    }

    fn activity(&self) -> MutexGuard<'_, ActivityState> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self) -> MutexGuard<'_, WorkQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- ActivityState ----

    /// 进入活动并启动看门狗；已处于同一活动时不做任何事。返回当前激活的 generation。
    pub fn set_activity(self: &Arc<Self>, name: ActivityName) -> u64 {
        let mut activity = self.activity();
        let Some(generation) = activity.enter(name) else {
            return activity.generation();
        };
        tracing::info!(activity = %name, "Starting activity");

        let ctx = Arc::downgrade(self);
        let timeout = self.watchdog_timeout;
        activity.arm(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(ctx) = ctx.upgrade() {
                ctx.expire(name, generation);
            }
        }));
        generation
    }

    /// 无条件回到 Idle 并取消看门狗
    pub fn clear_activity(&self) {
        if let Some(previous) = self.activity().clear() {
            tracing::info!(activity = %previous, "Clearing activity");
        }
    }

    /// 只在 `generation` 仍是当前激活时回到 Idle；被看门狗重置或被他人接管后为 no-op
    pub fn release_activity(&self, generation: u64) -> bool {
        let mut activity = self.activity();
        if activity.generation() != generation || activity.is_idle() {
            return false;
        }
        if let Some(previous) = activity.clear() {
            tracing::info!(activity = %previous, "Clearing activity");
        }
        true
    }

    /// 只有 `generation` 仍是当前激活时才切换到 `name`，返回新的 generation
    pub(crate) fn hand_off_activity(
        self: &Arc<Self>,
        generation: u64,
        name: ActivityName,
    ) -> Option<u64> {
        {
            let activity = self.activity();
            if activity.is_idle() || activity.generation() != generation {
                return None;
            }
        }
        Some(self.set_activity(name))
    }

    fn expire(&self, name: ActivityName, generation: u64) {
        let mut activity = self.activity();
        if activity.current() != Some(name) || activity.generation() != generation {
            return;
        }
        activity.expire();
        self.watchdog_faults.fetch_add(1, Ordering::SeqCst);
        tracing::error!(
            activity = %name,
            timeout_secs = self.watchdog_timeout.as_secs(),
            "Activity timed out, forcing idle"
        );
    }

    pub fn current_activity(&self) -> Option<ActivityName> {
        self.activity().current()
    }

    pub fn is_idle(&self) -> bool {
        self.activity().is_idle()
    }

    /// 非 Idle 且不是 `own` 时为忙
    pub fn is_busy_with_other(&self, own: ActivityName) -> bool {
        matches!(self.activity().current(), Some(current) if current != own)
    }

    pub fn has_watchdog(&self) -> bool {
        self.activity().has_watchdog()
    }

    pub fn watchdog_faults(&self) -> u64 {
        self.watchdog_faults.load(Ordering::SeqCst)
    }

    // ---- flags ----

    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// 置位 EmergencyFlag；只有第一次调用返回 true。该标志永不清除。
    pub fn raise_emergency(&self) -> bool {
        !self.emergency.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        &self.shutdown
    }

    // ---- drain gate ----

    fn may_dispatch(&self) -> bool {
        self.is_idle() && !self.is_emergency()
    }

    /// 满足条件（Idle、非紧急、没有排空在进行）时弹出队首并标记 draining
    pub(crate) fn begin_drain(&self) -> Option<ActionRequest> {
        let may_dispatch = self.may_dispatch();
        let mut queue = self.queue();
        if queue.is_draining() || !may_dispatch {
            return None;
        }
        let next = queue.pop_front()?;
        queue.set_draining(true);
        Some(next)
    }

    /// 排空循环在一个动作完成后调用：可继续则弹出下一项，否则释放 draining
    pub(crate) fn continue_drain(&self) -> Option<ActionRequest> {
        let may_dispatch = self.may_dispatch();
        let mut queue = self.queue();
        let next = if may_dispatch { queue.pop_front() } else { None };
        if next.is_none() {
            queue.set_draining(false);
        }
        next
    }

    /// 会话结束时的清理：回到 Idle，并释放该会话可能遗留的 draining 标记
    pub(crate) fn end_session(&self) {
        self.clear_activity();
        let mut queue = self.queue();
        if queue.is_draining() {
            tracing::info!(queued = queue.len(), "Releasing drain left by ended session");
            queue.set_draining(false);
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let (activity, activity_since) = {
            let state = self.activity();
            (state.current(), state.current().map(|_| state.started_at()))
        };
        let queue = self.queue();
        SchedulerSnapshot {
            activity,
            activity_since,
            queued: queue.kinds(),
            draining: queue.is_draining(),
            emergency: self.is_emergency(),
            shutdown: self.is_shutdown(),
            watchdog_faults: self.watchdog_faults(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<SchedulerContext> {
        SchedulerContext::new(Duration::from_secs(120), ShutdownManager::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_clear_disarms_watchdog() {
        let ctx = context();
        ctx.set_activity(ActivityName::StoringItems);
        assert_eq!(ctx.current_activity(), Some(ActivityName::StoringItems));
        assert!(ctx.has_watchdog());

        ctx.clear_activity();
        assert!(ctx.is_idle());
        assert!(!ctx.has_watchdog());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(ctx.watchdog_faults(), 0);
        assert!(ctx.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_forces_idle_once() {
        let ctx = context();
        let generation = ctx.set_activity(ActivityName::Emptying);

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(ctx.current_activity(), Some(ActivityName::Emptying));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(ctx.is_idle());
        assert_eq!(ctx.watchdog_faults(), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ctx.watchdog_faults(), 1);

        // 被看门狗重置后，原处理器的收尾不应生效
        assert!(!ctx.release_activity(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_activity_is_noop() {
        let ctx = context();
        let first = ctx.set_activity(ActivityName::Selling);
        tokio::time::sleep(Duration::from_secs(100)).await;
        let second = ctx.set_activity(ActivityName::Selling);
        assert_eq!(first, second);

        // 看门狗没有被重新计时：仍在最初的 120s 触发
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(ctx.is_idle());
        assert_eq!(ctx.watchdog_faults(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_activity_rearms_watchdog() {
        let ctx = context();
        ctx.set_activity(ActivityName::Emptying);
        tokio::time::sleep(Duration::from_secs(100)).await;
        ctx.set_activity(ActivityName::Selling);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ctx.current_activity(), Some(ActivityName::Selling));
        assert_eq!(ctx.watchdog_faults(), 0);
    }

    #[tokio::test]
    async fn test_stale_release_does_not_clobber_newer_activity() {
        let ctx = context();
        let old = ctx.set_activity(ActivityName::StoringItems);
        ctx.clear_activity();
        ctx.set_activity(ActivityName::Breaking);
        assert!(!ctx.release_activity(old));
        assert_eq!(ctx.current_activity(), Some(ActivityName::Breaking));
    }

    #[tokio::test]
    async fn test_drain_gate() {
        let ctx = context();
        ctx.queue().push(ActionRequest::StoreItems);
        ctx.queue().push(ActionRequest::LiquidateItems);

        ctx.set_activity(ActivityName::Selling);
        assert!(ctx.begin_drain().is_none());
        ctx.clear_activity();

        assert_eq!(ctx.begin_drain(), Some(ActionRequest::StoreItems));
        assert!(ctx.queue().is_draining());
        // 已在排空：不会再次开始
        assert!(ctx.begin_drain().is_none());

        assert!(ctx.raise_emergency());
        assert!(!ctx.raise_emergency());
        assert!(ctx.continue_drain().is_none());
        assert!(!ctx.queue().is_draining());
        assert!(ctx.begin_drain().is_none());
        assert_eq!(ctx.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_releases_activity_and_drain() {
        let ctx = context();
        ctx.queue().push(ActionRequest::StoreItems);
        ctx.queue().push(ActionRequest::LiquidateItems);
        assert_eq!(ctx.begin_drain(), Some(ActionRequest::StoreItems));
        ctx.set_activity(ActivityName::StoringItems);

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.activity, Some(ActivityName::StoringItems));
        assert!(snapshot.activity_since.is_some());
        assert!(snapshot.draining);

        ctx.end_session();
        let snapshot = ctx.snapshot();
        assert!(snapshot.activity.is_none());
        assert!(snapshot.activity_since.is_none());
        assert!(!snapshot.draining);
        // 普通重连不清空队列
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(ctx.begin_drain(), Some(ActionRequest::LiquidateItems));
    }
}
