//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发一次关闭，之后按注册顺序执行清理任务，每个任务有独立超时。
//! JobManagerCleanup 负责终止所有未结束的作业，服务退出后不会留下孤儿子进程。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::jobs::JobManager;

/// 默认的单个清理任务超时
const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// 关闭信号
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭（重复触发无副作用）
    pub fn trigger(&self, source: &'static str) {
        if !self.token.is_cancelled() {
            tracing::info!(source, "Shutdown requested");
        }
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.trigger("ctrl-c");
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.trigger("sigterm");
                    }
                    Err(e) => tracing::warn!(error = %e, "Cannot listen for SIGTERM"),
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 依次执行清理任务；失败或超时只记录日志，不影响后续任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 返回成功完成的任务数
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let mut completed = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!("Cleanup task '{}' completed", name);
                }
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {}ms",
                    name,
                    self.timeout.as_millis()
                ),
            }
        }
        completed
    }
}

/// 作业管理器清理：停止定时清理，终止全部未结束作业并等待它们退出
pub struct JobManagerCleanup {
    manager: Arc<JobManager>,
}

impl JobManagerCleanup {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for JobManagerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let terminated = self.manager.shutdown().await;
        if terminated > 0 {
            tracing::info!(terminated, "Terminated unfinished jobs");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "JobManager"
    }
}

/// 运行 app 直到它自行结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future,
{
    shutdown.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = shutdown.wait_for_shutdown() => tracing::info!("Shutdown signal received"),
    }

    cleanup().await;
}
