//! 连接管理：建立会话、驱动会话事件、断线后按 RecoveryEngine 的决定重连
//!
//! 状态机：Connecting → Connected → (Disconnected | Terminated | Failed)，通过 watch 通道对外发布。
//! 调度上下文跨重连复用；每个会话拥有自己的 SessionSupervisor、PostureGuard 与 Scheduler。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::core::{
    PostureGuard, RecoveryAction, RecoveryEngine, RetryCounter, Scheduler, SchedulerContext,
    SessionSupervisor, ShutdownManager,
};
use crate::world::{Session, SessionEvent, World, WorldConnector};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// 主动关闭后不再重连
    Terminated,
    /// 重连次数耗尽
    Failed,
}

/// `run` 的最终结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Terminated,
    /// 需要外部重启
    Fatal { attempts: u32 },
}

pub struct ConnectionManager {
    connector: Arc<dyn WorldConnector>,
    config: Arc<AppConfig>,
    ctx: Arc<SchedulerContext>,
    recovery: RecoveryEngine,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn WorldConnector>,
        config: AppConfig,
        shutdown: ShutdownManager,
    ) -> Self {
        let ctx = SchedulerContext::new(
            Duration::from_secs(config.activity.watchdog_secs),
            shutdown,
        );
        let recovery = RecoveryEngine::new(config.reconnect.max_attempts, config.reconnect.delay());
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            connector,
            config: Arc::new(config),
            ctx,
            recovery,
            state_tx,
        }
    }

    pub fn context(&self) -> Arc<SchedulerContext> {
        Arc::clone(&self.ctx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn retries(&self) -> &RetryCounter {
        self.recovery.retries()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// 运行到主动关闭或重连耗尽
    pub async fn run(&mut self) -> ConnectionOutcome {
        let credentials = self.config.server.credentials();
        loop {
            if self.ctx.is_shutdown() {
                self.set_state(ConnectionState::Terminated);
                tracing::info!("Session ended deliberately, not reconnecting");
                return ConnectionOutcome::Terminated;
            }

            self.set_state(ConnectionState::Connecting);
            tracing::info!(host = %credentials.host, port = credentials.port, "Connecting");
            match self.connector.connect(&credentials).await {
                Ok(session) => self.drive(session).await,
                Err(e) => tracing::warn!(error = %e, "Connection attempt failed"),
            }

            match self.recovery.handle(self.ctx.is_shutdown()) {
                RecoveryAction::Terminate => {
                    self.set_state(ConnectionState::Terminated);
                    tracing::info!("Session ended deliberately, not reconnecting");
                    return ConnectionOutcome::Terminated;
                }
                RecoveryAction::Reconnect { attempt, delay } => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::info!(
                        attempt,
                        max_attempts = self.recovery.retries().max(),
                        delay_ms = delay.as_millis() as u64,
                        "Attempting to reconnect"
                    );
                    let shutdown = self.ctx.shutdown_manager().clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for_shutdown() => {}
                    }
                }
                RecoveryAction::GiveUp => {
                    let attempts = self.recovery.retries().count();
                    self.set_state(ConnectionState::Failed);
                    tracing::error!(
                        attempts,
                        "Max reconnection attempts reached, manual restart required"
                    );
                    return ConnectionOutcome::Fatal { attempts };
                }
            }
        }
    }

    /// 驱动一个会话直到它结束，然后清理该会话拥有的一切
    async fn drive(&mut self, session: Session) {
        let Session { world, mut events } = session;
        let supervisor = SessionSupervisor::new();
        let posture = PostureGuard::new(Arc::clone(&world), &self.config.posture);
        let shutdown = self.ctx.shutdown_manager().clone();
        let revert_delay = Duration::from_millis(self.config.posture.revert_delay_ms);
        let mut scheduler: Option<Scheduler> = None;
        let mut quit_sent = false;

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.wait_for_shutdown(), if !quit_sent => {
                    tracing::info!("Shutdown requested, ending session");
                    quit_sent = true;
                    world.quit();
                    continue;
                }
            };

            match event {
                Some(SessionEvent::Spawned) => {
                    if scheduler.is_none() {
                        scheduler = Some(self.on_spawned(&world, &posture, &supervisor));
                    } else {
                        posture.enforce();
                    }
                }
                Some(SessionEvent::LoginConfirmed) => {
                    tracing::info!("Logged in");
                    posture.enforce();
                }
                Some(SessionEvent::Error(message)) => {
                    tracing::warn!(error = %message, "Session error");
                    posture.enforce();
                }
                Some(SessionEvent::PostureChanged(false)) => {
                    tracing::warn!("Posture was turned off, forcing back on");
                    let posture = posture.clone();
                    let session = supervisor.child_token();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = session.cancelled() => {}
                            _ = tokio::time::sleep(revert_delay) => {
                                posture.enforce();
                            }
                        }
                    });
                }
                Some(SessionEvent::PostureChanged(true)) => {}
                Some(SessionEvent::Kicked(reason)) => {
                    if self.ctx.is_shutdown() {
                        tracing::info!(reason = %reason, "Kicked during deliberate exit");
                    } else {
                        tracing::warn!(reason = %reason, "Kicked from server");
                    }
                    break;
                }
                Some(SessionEvent::Ended) | None => {
                    if self.ctx.is_shutdown() {
                        tracing::info!("Session closed");
                    } else {
                        tracing::warn!("Disconnected from server");
                    }
                    break;
                }
            }
        }

        supervisor.cancel();
        posture.stop_watch();
        self.ctx.end_session();
        drop(scheduler);
        let snapshot = self.ctx.snapshot();
        tracing::info!(
            session = %supervisor.id(),
            snapshot = %serde_json::to_string(&snapshot).unwrap_or_default(),
            "Session cleaned up"
        );
    }

    fn on_spawned(
        &mut self,
        world: &Arc<dyn World>,
        posture: &PostureGuard,
        supervisor: &SessionSupervisor,
    ) -> Scheduler {
        self.recovery.on_connected();
        self.set_state(ConnectionState::Connected);
        tracing::info!(
            session = %supervisor.id(),
            username = %world.username(),
            "Agent spawned"
        );

        posture.enforce();
        posture.start_watch(Duration::from_millis(self.config.posture.watch_interval_ms));

        let scheduler = Scheduler::new(
            Arc::clone(&self.ctx),
            Arc::clone(world),
            posture.clone(),
            Arc::clone(&self.config),
            supervisor.cancel_token(),
        );
        scheduler.start_triggers();
        scheduler
    }
}
