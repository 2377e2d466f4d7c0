//! 姿态守护：持续强制一个必需的布尔姿态
//!
//! - `enforce`：姿态关闭时打开它并记录时间，是唯一允许切换姿态的地方
//! - `start_watch`：低频巡检，距上次强制超过阈值即再次强制；重启会取消上一次巡检
//! - `wrap`：在被包裹的操作执行期间运行紧密的强制循环，任何退出路径（完成、出错、被 drop）都会停止该循环

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PostureSection;
use crate::world::World;

struct PostureInner {
    world: Arc<dyn World>,
    last_enforced: Mutex<Instant>,
    watch: Mutex<Option<JoinHandle<()>>>,
    tight_loops: AtomicUsize,
    lapse_threshold: Duration,
    critical_interval: Duration,
}

/// 姿态守护（每个 Session 一个，可廉价 clone）
#[derive(Clone)]
pub struct PostureGuard {
    inner: Arc<PostureInner>,
}

impl PostureGuard {
    pub fn new(world: Arc<dyn World>, settings: &PostureSection) -> Self {
        Self {
            inner: Arc::new(PostureInner {
                world,
                last_enforced: Mutex::new(Instant::now()),
                watch: Mutex::new(None),
                tight_loops: AtomicUsize::new(0),
                lapse_threshold: Duration::from_millis(settings.lapse_threshold_ms),
                critical_interval: Duration::from_millis(settings.critical_interval_ms.max(1)),
            }),
        }
    }

    fn last_enforced(&self) -> MutexGuard<'_, Instant> {
        self.inner
            .last_enforced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn watch_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 幂等：姿态关闭时打开它；返回强制后的实际状态
    pub fn enforce(&self) -> bool {
        let world = &self.inner.world;
        if !world.posture() {
            world.set_posture(true);
            *self.last_enforced() = Instant::now();
            tracing::info!("Forcing posture on");
        }
        world.posture()
    }

    /// 启动巡检；已有巡检时先取消
    pub fn start_watch(&self, interval: Duration) {
        let guard = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let lapsed = guard.last_enforced().elapsed() > guard.inner.lapse_threshold;
                if lapsed {
                    guard.enforce();
                }
            }
        });
        if let Some(previous) = self.watch_slot().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_watch(&self) {
        if let Some(handle) = self.watch_slot().take() {
            handle.abort();
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watch_slot().is_some()
    }

    /// 当前仍在运行的紧密强制循环数量（wrap / wrap_with 结束后应回到 0）
    pub fn active_tight_loops(&self) -> usize {
        self.inner.tight_loops.load(Ordering::SeqCst)
    }

    /// 以 `critical_interval` 周期包裹操作
    pub async fn wrap<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        self.wrap_with(self.inner.critical_interval, operation).await
    }

    /// 以指定周期包裹操作（挖掘等需要更高频率的场景）
    pub async fn wrap_with<F, T>(&self, period: Duration, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _tight = TightLoop::start(self.clone(), period);
        self.enforce();
        let result = operation.await;
        self.enforce();
        result
    }
}

/// wrap 期间的紧密循环；drop 时停止，覆盖所有退出路径
struct TightLoop {
    handle: JoinHandle<()>,
    guard: PostureGuard,
}

impl TightLoop {
    fn start(guard: PostureGuard, period: Duration) -> Self {
        guard.inner.tight_loops.fetch_add(1, Ordering::SeqCst);
        let ticking = guard.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                ticking.enforce();
            }
        });
        Self { handle, guard }
    }
}

impl Drop for TightLoop {
    fn drop(&mut self) {
        self.handle.abort();
        self.guard.inner.tight_loops.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::MockWorld;

    fn guard_for(world: &Arc<MockWorld>) -> PostureGuard {
        PostureGuard::new(world.clone() as Arc<dyn World>, &PostureSection::default())
    }

    #[tokio::test]
    async fn test_enforce_is_idempotent() {
        let world = Arc::new(MockWorld::new("me"));
        let guard = guard_for(&world);
        assert!(!world.posture());
        assert!(guard.enforce());
        assert!(guard.enforce());
        assert!(world.posture());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_reasserts_during_operation() {
        let world = Arc::new(MockWorld::new("me"));
        let guard = guard_for(&world);

        let observed = guard
            .wrap(async {
                let at_start = world.posture();
                world.revert_posture();
                tokio::time::sleep(Duration::from_millis(100)).await;
                let at_end = world.posture();
                (at_start, at_end)
            })
            .await;

        assert_eq!(observed, (true, true));
        assert!(world.posture());
        assert_eq!(guard.active_tight_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_stops_loop_on_error() {
        let world = Arc::new(MockWorld::new("me"));
        let guard = guard_for(&world);

        let result: Result<(), &str> = guard
            .wrap(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err("boom")
            })
            .await;

        assert!(result.is_err());
        assert_eq!(guard.active_tight_loops(), 0);
        assert!(world.posture());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_stops_loop_when_dropped_midway() {
        let world = Arc::new(MockWorld::new("me"));
        let guard = guard_for(&world);

        let pending = guard.wrap(tokio::time::sleep(Duration::from_secs(60)));
        let timed_out = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(guard.active_tight_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_restores_lapsed_posture() {
        let world = Arc::new(MockWorld::new("me"));
        let guard = guard_for(&world);
        guard.enforce();
        guard.start_watch(Duration::from_millis(50));
        guard.start_watch(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        world.revert_posture();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(world.posture());

        guard.stop_watch();
        assert!(!guard.is_watching());
        world.revert_posture();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!world.posture());
    }
}
