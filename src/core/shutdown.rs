//! 退出流程
//!
//! 输入结束、Ctrl+C 或 SIGTERM 任一发生即进入退出：先停报警（tick、调度、全部报警循环），
//! 再关闭事件日志。每一步有超时，超时只记日志不阻塞后续步骤。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::Monitor;
use crate::journal::EventJournal;

/// 退出触发源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

/// 持有全局退出 token；Monitor 等组件挂在它的子 token 上
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutting down ({:?})", reason);
        }
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM（unix）都转成 shutdown
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler not installed: {}", e),
                }
            });
        }
    }
}

/// 退出时的一个清理步骤
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理步骤
pub struct ShutdownCoordinator {
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            step_timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Box::new(step));
    }

    /// 返回成功完成的步骤数
    pub async fn run_cleanup(&self) -> usize {
        let mut completed = 0;
        for step in &self.steps {
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("{} released", step.name());
                    completed += 1;
                }
                Ok(Err(e)) => tracing::warn!("{} cleanup failed: {:#}", step.name(), e),
                Err(_) => tracing::warn!(
                    "{} cleanup exceeded {:?}, skipped",
                    step.name(),
                    self.step_timeout
                ),
            }
        }
        completed
    }
}

/// 停止 tick、报警调度与全部报警循环
pub struct AlarmCleanup {
    monitor: Arc<Monitor>,
}

impl AlarmCleanup {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for AlarmCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.monitor.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "alarms"
    }
}

/// 落盘剩余事件并关闭写线程；须排在 AlarmCleanup 之后
pub struct JournalCleanup {
    journal: Arc<EventJournal>,
}

impl JournalCleanup {
    pub fn new(journal: Arc<EventJournal>) -> Self {
        Self { journal }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for JournalCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.journal.close().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "journal"
    }
}

/// 运行 app 直到它结束或收到退出信号，然后执行 cleanup
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();
    tokio::select! {
        _ = app => tracing::info!("Input finished"),
        _ = manager.wait_for_shutdown() => {}
    }
    cleanup().await;
}
