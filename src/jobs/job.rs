//! 作业：一次动作执行的身份、状态、日志与取消
//!
//! - 状态迁移：pending → running → success / error（排队中被取消或启动失败时直接 error）
//! - 取消：先向整个进程组发 SIGTERM，后台看门狗等待宽限期，仍未结束则 SIGKILL
//! - 锁顺序：JobManager 状态锁 → Job 状态锁 → Job 日志锁，任何锁都不跨进程 I/O 持有

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::action::{ActionDefinition, JobArgs};
use super::log_store::{LogEntry, LogStore, LogStream, DEFAULT_MAX_LOG_LINES};
use super::process::{self, ProcessSignal};

/// 优雅终止后等待进程退出的宽限期
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// SIGKILL 之后再观察一次退出结果的时间
const KILL_SETTLE: Duration = Duration::from_millis(500);

/// 未能运行（排队中取消、启动失败、等待失败）时记录的退出码
pub const NOT_RUN_EXIT_CODE: i32 = -1;

/// 作业 ID（32 位十六进制）
pub type JobId = String;

static NEXT_JOB_ORDINAL: AtomicU64 = AtomicU64::new(0);

/// 作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// 等待并发槽位
    Pending,
    /// 进程运行中
    Running,
    /// 退出码为 0 且未被取消
    Success,
    /// 非 0 退出、被取消或启动失败
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生命周期字段的一致快照
///
/// 不变式：exit_code 有值 ⇔ 终态；started_at 有值 ⇔ 非 pending；cancel_requested 只会 false → true。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobState {
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub cancel_requested: bool,
}

impl JobState {
    fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            exit_code: None,
            cancel_requested: false,
        }
    }
}

/// 已附着进程的控制端；进程回收后立即清空
#[derive(Debug, Clone)]
struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<ProcessSignal>,
}

#[derive(Debug)]
struct Inner {
    state: JobState,
    process: Option<ProcessHandle>,
}

/// 一次动作执行
pub struct Job {
    id: JobId,
    ordinal: u64,
    action: Arc<ActionDefinition>,
    command: Vec<String>,
    created_at: DateTime<Utc>,
    cancel_grace: Duration,
    inner: Mutex<Inner>,
    logs: Mutex<LogStore>,
    /// 执行结束（进程回收、输出读完）后写入退出码
    reaped: watch::Sender<Option<i32>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("action", &self.action.id)
            .field("command", &self.command)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(action: Arc<ActionDefinition>, args: &JobArgs) -> Self {
        let mut command = action.command.clone();
        command.extend(args.resolve(&action));
        let (reaped, _) = watch::channel(None);
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            ordinal: NEXT_JOB_ORDINAL.fetch_add(1, Ordering::Relaxed),
            action,
            command,
            created_at: Utc::now(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            inner: Mutex::new(Inner {
                state: JobState::new(),
                process: None,
            }),
            logs: Mutex::new(LogStore::new(DEFAULT_MAX_LOG_LINES)),
            reaped,
        }
    }

    /// 设置日志容量（仅在作业共享之前调用）
    pub fn with_log_capacity(mut self, max_lines: usize) -> Self {
        self.logs = Mutex::new(LogStore::new(max_lines));
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 进程内单调递增的创建序号，用于同一时刻创建的作业排序
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn action(&self) -> &Arc<ActionDefinition> {
        &self.action
    }

    /// 可执行文件 + 最终参数
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn display_command(&self) -> String {
        process::shell_join(&self.command)
    }

    pub async fn state(&self) -> JobState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> JobStatus {
        self.inner.lock().await.state.status
    }

    pub async fn is_terminal(&self) -> bool {
        self.status().await.is_terminal()
    }

    /// 当前附着进程的 pid（未启动或已回收时为 None）
    pub async fn pid(&self) -> Option<u32> {
        self.inner
            .lock()
            .await
            .process
            .as_ref()
            .and_then(|p| p.pid)
    }

    /// 追加一行日志（stdout / stderr 读取与取消提示并发写入，经日志锁串行化）
    pub async fn append_log(&self, stream: LogStream, text: impl Into<String>) -> LogEntry {
        self.logs.lock().await.append(stream, text)
    }

    pub(crate) async fn system_log(&self, text: impl Into<String>) {
        self.append_log(LogStream::System, text).await;
    }

    /// 返回 cursor 之后的日志与当前最大序号
    pub async fn collect_logs(&self, cursor: i64) -> (Vec<LogEntry>, u64) {
        self.logs.lock().await.collect(cursor)
    }

    /// 请求取消（幂等）；已是终态时返回 false
    ///
    /// 首次调用记录提示行，若有进程则请求执行任务发送 SIGTERM 并启动后台看门狗；
    /// 「已发送」提示由执行任务在信号真正送达后写入。调用方不会被看门狗阻塞。
    pub async fn request_cancel(self: &Arc<Self>) -> bool {
        let (first, process) = {
            let mut inner = self.inner.lock().await;
            if inner.state.status.is_terminal() {
                return false;
            }
            let first = !inner.state.cancel_requested;
            inner.state.cancel_requested = true;
            (first, if first { inner.process.clone() } else { None })
        };

        if !first {
            return true;
        }

        tracing::info!(job_id = %self.id, "cancellation requested");
        self.system_log("终止命令请求已发送…").await;

        if let Some(handle) = process {
            if handle.control.send(ProcessSignal::Terminate).is_err() {
                self.system_log("进程已不存在。").await;
            } else {
                tracing::debug!(job_id = %self.id, pid = ?handle.pid, "SIGTERM requested");
                self.spawn_watchdog(handle.control);
            }
        }
        true
    }

    /// 宽限期内未结束则升级为 SIGKILL
    fn spawn_watchdog(self: &Arc<Self>, control: mpsc::UnboundedSender<ProcessSignal>) {
        let job = Arc::clone(self);
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            if job.wait_reaped(grace).await.is_some() {
                return;
            }

            tracing::warn!(job_id = %job.id, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, escalating");
            job.system_log(format!(
                "进程未在 {} 内响应，正在强制终止 (SIGKILL)…",
                describe_duration(grace)
            ))
            .await;

            if control.send(ProcessSignal::Kill).is_err() {
                job.system_log("进程已不存在。").await;
                return;
            }
            if let Some(code) = job.wait_reaped(KILL_SETTLE).await {
                job.system_log(format!("进程已被强制终止，退出码: {code}"))
                    .await;
            }
        });
    }

    async fn wait_reaped(&self, limit: Duration) -> Option<i32> {
        let mut rx = self.reaped.subscribe();
        tokio::time::timeout(limit, async move {
            rx.wait_for(Option::is_some).await.ok().and_then(|code| *code)
        })
        .await
        .ok()
        .flatten()
    }

    /// pending → running；已被终止（或已在运行）时返回 false
    pub(crate) async fn try_start(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state.status != JobStatus::Pending {
            return false;
        }
        inner.state.status = JobStatus::Running;
        inner.state.started_at = Some(Utc::now());
        true
    }

    /// 写入终态；success 仅当退出码为 0 且未请求取消
    pub(crate) async fn finish(&self, exit_code: i32) -> JobStatus {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let state = &mut inner.state;
        if state.started_at.is_none() {
            state.started_at = Some(now);
        }
        state.finished_at = Some(now);
        state.exit_code = Some(exit_code);
        state.status = if exit_code == 0 && !state.cancel_requested {
            JobStatus::Success
        } else {
            JobStatus::Error
        };
        state.status
    }

    /// 启动进程、并发读取两路输出、等待退出，返回退出码
    ///
    /// 进程回收且两路输出都读到 EOF 才算结束。所有失败都在这里转成系统日志与退出码，不向调用方传播。
    pub(crate) async fn execute(&self) -> i32 {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let mut child = {
            let mut inner = self.inner.lock().await;
            if inner.state.cancel_requested {
                drop(inner);
                tracing::info!(job_id = %self.id, "cancelled before spawn, skipping");
                self.system_log("任务在启动前已被取消，未执行。").await;
                return NOT_RUN_EXIT_CODE;
            }

            let spawned = process::build_command(&self.command, &self.action.env)
                .and_then(|mut command| command.spawn());
            match spawned {
                Ok(child) => {
                    inner.process = Some(ProcessHandle {
                        pid: child.id(),
                        control: control_tx,
                    });
                    child
                }
                Err(err) => {
                    drop(inner);
                    tracing::warn!(job_id = %self.id, command = %self.display_command(), error = %err, "spawn failed");
                    self.system_log(format!("执行失败: {err}")).await;
                    return NOT_RUN_EXIT_CODE;
                }
            }
        };

        let pid = child.id();
        tracing::info!(job_id = %self.id, action = %self.action.id, pid = ?pid, "process started");

        // 子进程是自己进程组的组长，组号即 pid
        let group = if cfg!(unix) { pid } else { None };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pumps = async {
            tokio::join!(
                self.pump(stdout, LogStream::Stdout),
                self.pump(stderr, LogStream::Stderr),
            )
        };
        tokio::pin!(pumps);

        // 组长退出后后台进程可能仍持有输出管道，期间照常处理终止请求；
        // SIGKILL 之后管道仍未关闭（进程已脱离进程组）则放弃读取
        let mut status = None;
        let mut drained = false;
        let mut abandon_at: Option<Instant> = None;
        while status.is_none() || !drained {
            tokio::select! {
                res = child.wait(), if status.is_none() => status = Some(res),
                _ = &mut pumps, if !drained => drained = true,
                Some(signal) = control_rx.recv() => {
                    self.deliver(&mut child, group, signal).await;
                    if signal == ProcessSignal::Kill {
                        abandon_at = Some(Instant::now() + KILL_SETTLE);
                    }
                }
                _ = tokio::time::sleep_until(abandon_at.unwrap_or_else(Instant::now)),
                    if abandon_at.is_some() && status.is_some() && !drained =>
                {
                    tracing::warn!(job_id = %self.id, "output pipes still open after SIGKILL, detaching");
                    self.system_log("输出管道仍被占用，停止读取。").await;
                    break;
                }
            }
        }
        let status = status.unwrap_or_else(|| Err(io::Error::other("进程未被回收")));

        let exit_code = match status {
            Ok(status) => process::exit_code(status),
            Err(err) => {
                tracing::warn!(job_id = %self.id, error = %err, "wait failed");
                self.system_log(format!("执行失败: {err}")).await;
                NOT_RUN_EXIT_CODE
            }
        };

        let cancelled = {
            let mut inner = self.inner.lock().await;
            inner.process = None;
            inner.state.cancel_requested
        };
        self.reaped.send_replace(Some(exit_code));

        if cancelled {
            self.system_log(format!("进程已终止，退出码: {exit_code}")).await;
        }
        tracing::info!(job_id = %self.id, exit_code, cancelled, "process exited");
        exit_code
    }

    /// 发送信号并记录结果；「已发送」提示只在信号送达后写入
    async fn deliver(&self, child: &mut Child, group: Option<u32>, signal: ProcessSignal) {
        match process::send_signal(child, group, signal) {
            Ok(()) => {
                tracing::debug!(job_id = %self.id, signal = signal.name(), ?group, "signal delivered");
                let text = match signal {
                    ProcessSignal::Terminate => "已发送 SIGTERM 信号，等待进程响应…",
                    ProcessSignal::Kill => "已发送 SIGKILL 信号。",
                };
                self.system_log(text).await;
            }
            Err(err) if process::is_process_gone(&err) => {
                self.system_log("进程已不存在。").await;
            }
            Err(err) => {
                tracing::warn!(job_id = %self.id, signal = signal.name(), error = %err, "failed to signal process");
                self.system_log(format!("发送 {} 失败: {err}", signal.name())).await;
            }
        }
    }

    async fn pump<R>(&self, reader: Option<R>, stream: LogStream)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let Some(reader) = reader else {
            return;
        };
        let pumped = process::pump_lines(reader, process::MAX_LINE_BYTES, |line| {
            self.append_log(stream, line)
        })
        .await;
        if let Err(err) = pumped {
            tracing::warn!(job_id = %self.id, %stream, error = %err, "output read failed");
            self.system_log(format!("读取 {stream} 失败: {err}")).await;
        }
    }
}

/// 「5 秒」/「300 毫秒」
fn describe_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{} 秒", d.as_secs())
    } else {
        format!("{} 毫秒", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Arc<ActionDefinition> {
        Arc::new(ActionDefinition::new(
            "sh",
            "shell",
            vec!["sh".into(), "-c".into(), script.into()],
        ))
    }

    async fn run(job: &Arc<Job>) -> JobStatus {
        assert!(job.try_start().await);
        let code = job.execute().await;
        job.finish(code).await
    }

    async fn texts(job: &Job) -> Vec<(LogStream, String)> {
        job.collect_logs(0)
            .await
            .0
            .into_iter()
            .map(|e| (e.stream, e.text))
            .collect()
    }

    #[test]
    fn test_job_resolves_command() {
        let action = Arc::new(
            ActionDefinition::new("a", "A", vec!["tool".into(), "sub".into()])
                .with_default_args(vec!["--flag".into()]),
        );
        let job = Job::new(Arc::clone(&action), &JobArgs::Defaults);
        assert_eq!(job.command(), ["tool", "sub", "--flag"]);
        assert_eq!(job.id().len(), 32);

        let job = Job::new(action, &JobArgs::Override(vec!["x y".into()]));
        assert_eq!(job.display_command(), "tool sub 'x y'");
    }

    #[tokio::test]
    async fn test_new_job_is_pending() {
        let job = Job::new(sh("true"), &JobArgs::Defaults);
        let state = job.state().await;
        assert_eq!(state.status, JobStatus::Pending);
        assert!(state.started_at.is_none());
        assert!(state.exit_code.is_none());
        assert!(!state.cancel_requested);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_both_streams() {
        let job = Arc::new(Job::new(
            sh("echo out; echo err 1>&2; printf 'tail'"),
            &JobArgs::Defaults,
        ));
        assert_eq!(run(&job).await, JobStatus::Success);

        let logs = texts(&job).await;
        assert!(logs.contains(&(LogStream::Stdout, "out".to_string())));
        assert!(logs.contains(&(LogStream::Stderr, "err".to_string())));
        assert!(logs.contains(&(LogStream::Stdout, "tail".to_string())));

        let state = job.state().await;
        assert_eq!(state.exit_code, Some(0));
        assert!(state.finished_at.is_some());
        assert!(job.pid().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let job = Arc::new(Job::new(sh("exit 3"), &JobArgs::Defaults));
        assert_eq!(run(&job).await, JobStatus::Error);
        assert_eq!(job.state().await.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_action_env_and_unbuffered_hint() {
        let action = Arc::new(
            ActionDefinition::new(
                "env",
                "env",
                vec![
                    "sh".into(),
                    "-c".into(),
                    "echo \"$GREETING $PYTHONUNBUFFERED\"".into(),
                ],
            )
            .with_env("GREETING", "hi"),
        );
        let job = Arc::new(Job::new(action, &JobArgs::Defaults));
        run(&job).await;
        assert!(texts(&job)
            .await
            .contains(&(LogStream::Stdout, "hi 1".to_string())));
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_error_state() {
        let action = Arc::new(ActionDefinition::new(
            "missing",
            "missing",
            vec!["/definitely/not/a/real/binary".into()],
        ));
        let job = Arc::new(Job::new(action, &JobArgs::Defaults));
        assert_eq!(run(&job).await, JobStatus::Error);

        let state = job.state().await;
        assert_eq!(state.exit_code, Some(NOT_RUN_EXIT_CODE));
        let logs = texts(&job).await;
        assert!(logs
            .iter()
            .any(|(s, t)| *s == LogStream::System && t.starts_with("执行失败")));
    }

    #[tokio::test]
    async fn test_cancel_before_spawn_skips_process() {
        let job = Arc::new(Job::new(sh("touch /tmp/never"), &JobArgs::Defaults));
        assert!(job.request_cancel().await);
        assert!(job.try_start().await);
        let code = job.execute().await;
        assert_eq!(code, NOT_RUN_EXIT_CODE);
        assert_eq!(job.finish(code).await, JobStatus::Error);

        let logs = texts(&job).await;
        assert!(logs.iter().any(|(_, t)| t.contains("未执行")));
    }

    #[tokio::test]
    async fn test_request_cancel_on_terminal_job_returns_false() {
        let job = Arc::new(Job::new(sh("true"), &JobArgs::Defaults));
        job.finish(0).await;
        assert!(!job.request_cancel().await);
        assert!(!job.state().await.cancel_requested);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_zero_exit_is_still_error() {
        // 进程收到 SIGTERM 后以 0 退出
        let job = Arc::new(
            Job::new(
                sh("trap 'exit 0' TERM; while true; do sleep 0.05; done"),
                &JobArgs::Defaults,
            )
            .with_cancel_grace(Duration::from_secs(5)),
        );
        assert!(job.try_start().await);
        let runner = {
            let job = Arc::clone(&job);
            tokio::spawn(async move { job.execute().await })
        };
        while job.pid().await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(job.request_cancel().await);
        let code = runner.await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(job.finish(code).await, JobStatus::Error);
    }

    #[test]
    fn test_describe_duration() {
        assert_eq!(describe_duration(Duration::from_secs(5)), "5 秒");
        assert_eq!(describe_duration(Duration::from_millis(300)), "300 毫秒");
    }
}
