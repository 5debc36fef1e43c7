//! 核心编排层：错误与恢复、事件投影、Monitor 主控、构建与优雅关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use builder::MonitorBuilder;
pub use error::{AudioError, NotifyError, RecoveryAction, WatchError};
pub use orchestrator::{monotonic_now, Monitor};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    run_with_graceful_shutdown, AlarmCleanup, JournalCleanup, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use state::{MonitorEvent, MonitorSummary};
