//! 作业管理器：准入控制、FIFO 调度、取消路由、过期清理
//!
//! jobs / pending / running 由一把管理器锁保护，只在集合变更时持有，从不跨进程 I/O 持有。
//! 每个运行中的作业由一个后台任务驱动；完成后释放槽位并按 FIFO 顺序补位。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::action::{ActionDefinition, JobArgs};
use super::job::{Job, JobId, DEFAULT_CANCEL_GRACE, NOT_RUN_EXIT_CODE};
use super::log_store::DEFAULT_MAX_LOG_LINES;
use crate::core::JobError;

/// 管理器配置；0 表示不限制 / 关闭
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    /// 同时运行的作业数（0 = 不限）
    pub max_concurrent: usize,
    /// 排队上限（0 = 不限）
    pub queue_limit: usize,
    /// 终态作业保留时长（0 = 永久保留）
    pub retention: Duration,
    /// 定时清理间隔（0 = 只做顺带清理）
    pub cleanup_interval: Duration,
    pub max_log_lines: usize,
    pub cancel_grace: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            queue_limit: 50,
            retention: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    jobs: HashMap<JobId, Arc<Job>>,
    /// 只保存引用，所有权在 jobs
    pending: VecDeque<Arc<Job>>,
    running: HashSet<JobId>,
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 作业管理器
pub struct JobManager {
    config: JobManagerConfig,
    state: Mutex<ManagerState>,
    sweeper: Mutex<Option<Sweeper>>,
    /// running 变空时通知
    idle: Notify,
}

impl JobManager {
    pub fn new(config: JobManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ManagerState::default()),
            sweeper: Mutex::new(None),
            idle: Notify::new(),
        })
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    fn has_free_slot(&self, state: &ManagerState) -> bool {
        self.config.max_concurrent == 0 || state.running.len() < self.config.max_concurrent
    }

    /// 创建作业：有空闲槽位则立即启动，否则排队；排队已满时拒绝且不登记
    pub async fn create(
        self: &Arc<Self>,
        action: Arc<ActionDefinition>,
        args: JobArgs,
    ) -> Result<Arc<Job>, JobError> {
        let job = Arc::new(
            Job::new(action, &args)
                .with_log_capacity(self.config.max_log_lines)
                .with_cancel_grace(self.config.cancel_grace),
        );

        let start_now = {
            let mut state = self.state.lock().await;
            let can_start = self.has_free_slot(&state);
            if !can_start
                && self.config.queue_limit > 0
                && state.pending.len() >= self.config.queue_limit
            {
                tracing::warn!(
                    action = %job.action().id,
                    queue_limit = self.config.queue_limit,
                    "job rejected, queue full"
                );
                return Err(JobError::Rejected {
                    queue_limit: self.config.queue_limit,
                });
            }

            state.jobs.insert(job.id().to_string(), Arc::clone(&job));
            if can_start {
                job.try_start().await;
                state.running.insert(job.id().to_string());
            } else {
                state.pending.push_back(Arc::clone(&job));
                // 位置只在入队时计算，之后不随前面作业的取消而更新
                let position = state.pending.len();
                job.system_log(format!("并发限制已满，任务已排队（当前第 {position} 位）。"))
                    .await;
                tracing::info!(job_id = %job.id(), position, "job queued");
            }
            can_start
        };

        if start_now {
            tracing::info!(job_id = %job.id(), action = %job.action().id, "job admitted");
            self.launch(Arc::clone(&job));
        }

        self.prune().await;
        Ok(job)
    }

    /// 启动执行任务；执行任务异常退出时同样释放槽位
    fn launch(self: &Arc<Self>, job: Arc<Job>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let exec = {
                let job = Arc::clone(&job);
                tokio::spawn(async move { job.execute().await })
            };
            let exit_code = match exec.await {
                Ok(code) => code,
                Err(err) => {
                    tracing::error!(job_id = %job.id(), error = %err, "execution task aborted");
                    job.system_log(format!("执行失败: {err}")).await;
                    NOT_RUN_EXIT_CODE
                }
            };
            manager.complete(&job, exit_code).await;
        });
    }

    /// 写入终态、释放槽位、按 FIFO 补位
    async fn complete(self: &Arc<Self>, job: &Arc<Job>, exit_code: i32) {
        let (to_start, idle) = {
            let mut state = self.state.lock().await;
            let status = job.finish(exit_code).await;
            state.running.remove(job.id());
            tracing::info!(job_id = %job.id(), %status, exit_code, "job finished");
            let to_start = self.drain_pending(&mut state).await;
            (to_start, state.running.is_empty())
        };
        if idle {
            self.idle.notify_waiters();
        }

        for next in to_start {
            tracing::info!(job_id = %next.id(), action = %next.action().id, "job dequeued");
            self.launch(next);
        }

        self.prune().await;
    }

    /// 在空闲槽位允许的范围内出队；跳过已被终止的作业（不重新入队）
    async fn drain_pending(&self, state: &mut ManagerState) -> Vec<Arc<Job>> {
        let mut to_start = Vec::new();
        while self.has_free_slot(state) {
            let Some(candidate) = state.pending.pop_front() else {
                break;
            };
            if !candidate.try_start().await {
                tracing::debug!(job_id = %candidate.id(), "skipping terminated queued job");
                continue;
            }
            state.running.insert(candidate.id().to_string());
            to_start.push(candidate);
        }
        to_start
    }

    async fn lookup(&self, id: &str) -> Result<Arc<Job>, JobError> {
        self.state
            .lock()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// 获取作业（先做一次顺带清理）
    pub async fn get(&self, id: &str) -> Result<Arc<Job>, JobError> {
        self.prune().await;
        self.lookup(id).await
    }

    /// 全部作业，按创建时间从新到旧
    pub async fn list(&self) -> Vec<Arc<Job>> {
        self.prune().await;
        let mut jobs: Vec<Arc<Job>> = self.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.ordinal().cmp(&a.ordinal()))
        });
        jobs
    }

    /// 终止作业：终态时原样返回；仍在排队的作业出队并直接标记为 error，之后绝不会启动
    pub async fn terminate(&self, id: &str) -> Result<Arc<Job>, JobError> {
        let job = self.lookup(id).await?;
        if job.is_terminal().await {
            return Ok(job);
        }

        job.request_cancel().await;

        let dequeued = {
            let mut state = self.state.lock().await;
            match state.pending.iter().position(|j| j.id() == id) {
                Some(index) => {
                    state.pending.remove(index);
                    job.finish(NOT_RUN_EXIT_CODE).await;
                    true
                }
                None => false,
            }
        };

        if dequeued {
            tracing::info!(job_id = %id, "queued job terminated before start");
            job.system_log("任务在排队中被终止，未执行。").await;
        }
        Ok(job)
    }

    /// 删除 finished_at 早于保留时长的作业，并清掉排队记录中的残留引用
    pub async fn prune(&self) -> usize {
        if self.config.retention.is_zero() {
            return 0;
        }
        let now = Utc::now();
        let retention = self.config.retention;

        let mut state = self.state.lock().await;
        let mut doomed = HashSet::new();
        for (id, job) in &state.jobs {
            let Some(finished_at) = job.state().await.finished_at else {
                continue;
            };
            let expired = now
                .signed_duration_since(finished_at)
                .to_std()
                .map(|age| age > retention)
                .unwrap_or(false);
            if expired {
                doomed.insert(id.clone());
            }
        }

        if doomed.is_empty() {
            return 0;
        }
        for id in &doomed {
            state.jobs.remove(id);
            state.running.remove(id);
        }
        state.pending.retain(|j| !doomed.contains(j.id()));
        tracing::info!(count = doomed.len(), "expired jobs removed");
        doomed.len()
    }

    /// 启动定时清理（间隔或保留时长为 0 时不启动；已在运行时忽略）
    pub async fn start_cleanup_task(self: &Arc<Self>) {
        if self.config.cleanup_interval.is_zero() || self.config.retention.is_zero() {
            return;
        }
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let interval = self.config.cleanup_interval;
        let manager = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.prune().await;
            }
        });
        tracing::debug!(interval_secs = interval.as_secs(), "cleanup task started");
        *sweeper = Some(Sweeper { token, handle });
    }

    pub async fn stop_cleanup_task(&self) {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            sweeper.token.cancel();
            let _ = sweeper.handle.await;
            tracing::debug!("cleanup task stopped");
        }
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// 关闭：停止定时清理，终止所有未结束的作业，并等待运行中的作业退出
    ///
    /// 等待本身不设上限，由调用方（ShutdownCoordinator）加超时。
    pub async fn shutdown(&self) -> usize {
        self.stop_cleanup_task().await;

        // 先清空排队，避免运行中的作业退出后又补位启动
        let ids: Vec<JobId> = {
            let state = self.state.lock().await;
            state
                .pending
                .iter()
                .map(|j| j.id().to_string())
                .chain(state.jobs.keys().cloned())
                .collect()
        };
        let mut terminated = 0;
        for id in ids {
            let Ok(job) = self.lookup(&id).await else {
                continue;
            };
            if job.is_terminal().await {
                continue;
            }
            if self.terminate(&id).await.is_ok() {
                terminated += 1;
            }
        }

        loop {
            let idle = self.idle.notified();
            if self.running_count().await == 0 {
                break;
            }
            idle.await;
        }
        tracing::info!(terminated, "job manager shut down");
        terminated
    }
}
