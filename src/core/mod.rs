//! 核心编排层：调度上下文、活动状态、工作队列、姿态守护、紧急撤离与连接恢复

pub mod connection;
pub mod context;
pub mod emergency;
pub mod error;
pub mod orchestrator;
pub mod posture;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod work_queue;

pub use connection::{ConnectionManager, ConnectionOutcome, ConnectionState};
pub use context::SchedulerContext;
pub use emergency::{find_intruder, EmergencyController};
pub use error::{ActionError, RecoveryAction};
pub use orchestrator::Scheduler;
pub use posture::PostureGuard;
pub use recovery::{RecoveryEngine, RetryCounter};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{ActivityName, ActivityState, SchedulerSnapshot};
pub use work_queue::{ActionKind, ActionRequest, WorkQueue};
