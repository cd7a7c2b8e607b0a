//! JobHive - 本地命令作业编排
//!
//! 用法：
//! ```bash
//! jobhive [--config <path>] actions                  # 列出动作
//! jobhive [--config <path>] run <action> [--replace] [-- args...]
//! jobhive [--config <path>] serve                    # stdin/stdout JSON 行协议
//! ```
//!
//! `run` 跟随输出直到作业结束，Ctrl+C 终止作业，进程以作业退出码退出。
//! `serve` 每行读一个请求（`{"op":"create","actionId":"..."}` 等），每行写一个响应。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use jobhive::catalog::load_catalog;
use jobhive::config::{load_config, AppConfig};
use jobhive::core::shutdown::run_with_graceful_shutdown;
use jobhive::core::{JobManagerCleanup, ShutdownCoordinator, ShutdownManager, ServiceError};
use jobhive::jobs::{JobManager, LogStream, NOT_RUN_EXIT_CODE};
use jobhive::service::{CreateJobRequest, JobService};

const USAGE: &str = "usage: jobhive [--config <path>] <actions | run <action> [--replace] [-- args...] | serve>";

/// 跟随日志的轮询间隔
const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

/// 关闭时在终止宽限期之外再给作业留出的时间
const CLEANUP_MARGIN: Duration = Duration::from_secs(5);

enum Command {
    Actions,
    Run {
        action_id: String,
        replace: bool,
        args: Vec<String>,
    },
    Serve,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<(Option<PathBuf>, Command)> {
    let mut config_path = None;
    let command = loop {
        match args.next().as_deref() {
            Some("--config") => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            Some("actions") => break Command::Actions,
            Some("serve") => break Command::Serve,
            Some("run") => {
                let action_id = args.next().context("run requires an action id")?;
                let mut replace = false;
                let mut extra = Vec::new();
                while let Some(arg) = args.next() {
                    match arg.as_str() {
                        "--replace" => replace = true,
                        "--" => {
                            extra.extend(args.by_ref());
                            break;
                        }
                        _ => extra.push(arg),
                    }
                }
                break Command::Run {
                    action_id,
                    replace,
                    args: extra,
                };
            }
            Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
            None => bail!("{USAGE}"),
        }
    };
    Ok((config_path, command))
}

fn build_service(cfg: &AppConfig) -> anyhow::Result<JobService> {
    let catalog = load_catalog(cfg.catalog.path.as_deref()).context("Failed to load action catalog")?;
    let manager = JobManager::new(cfg.jobs.manager_config());
    Ok(JobService::new(Arc::new(catalog), manager))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobhive::observability::init();

    let (config_path, command) = parse_args(std::env::args().skip(1))?;
    let cfg = load_config(config_path).context("Failed to load config")?;
    let service = build_service(&cfg)?;

    match command {
        Command::Actions => {
            for action in service.list_actions() {
                println!("{:<24} {}", action.id, action.title);
                println!("{:<24} $ {}", "", action.command_preview);
                if let Some(hint) = action.hint {
                    println!("{:<24} {}", "", hint);
                }
            }
            Ok(())
        }
        Command::Run {
            action_id,
            replace,
            args,
        } => {
            let code = run_job(service, action_id, replace, args).await?;
            std::process::exit(code);
        }
        Command::Serve => serve(service).await,
    }
}

/// 创建作业并跟随输出；第一次 Ctrl+C 发送终止请求，之后继续等待进程退出
async fn run_job(
    service: JobService,
    action_id: String,
    replace: bool,
    args: Vec<String>,
) -> anyhow::Result<i32> {
    let mut request = CreateJobRequest::new(action_id);
    if replace {
        request.args = Some(args);
    } else {
        request.extra_args = args;
    }
    let snapshot = service.create_job(request).await?;
    let job_id = snapshot.id.clone();
    eprintln!("$ {}", snapshot.display_command);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut cursor = 0i64;
    let mut terminate_sent = false;
    loop {
        let snapshot = service.get_job(&job_id, cursor).await?;
        for entry in &snapshot.logs {
            match entry.stream {
                LogStream::Stdout => println!("{}", entry.text),
                LogStream::Stderr => eprintln!("{}", entry.text),
                LogStream::System => eprintln!("[{}] {}", entry.stream, entry.text),
            }
        }
        cursor = snapshot.next_cursor as i64;

        if snapshot.status.is_terminal() {
            eprintln!("[{}] {}", snapshot.status, snapshot.id);
            return Ok(snapshot.exit_code.unwrap_or(NOT_RUN_EXIT_CODE));
        }

        tokio::select! {
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
            _ = shutdown.wait_for_shutdown(), if !terminate_sent => {
                terminate_sent = true;
                service.terminate_job(&job_id, cursor).await?;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum ServeRequest {
    Actions,
    Create(CreateJobRequest),
    List,
    Get {
        id: String,
        #[serde(default)]
        cursor: i64,
    },
    Terminate {
        id: String,
        #[serde(default)]
        cursor: i64,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ServeResponse {
    Ok { ok: bool, data: serde_json::Value },
    Err { ok: bool, error: ErrorBody },
}

impl ServeResponse {
    fn data<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Self::Ok { ok: true, data },
            Err(e) => Self::error("internal", e.to_string()),
        }
    }

    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}

impl From<ServiceError> for ServeResponse {
    fn from(err: ServiceError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

async fn handle_request(service: &JobService, line: &str) -> ServeResponse {
    let request: ServeRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return ServeResponse::error("bad_request", e.to_string()),
    };
    let result = match request {
        ServeRequest::Actions => return ServeResponse::data(service.list_actions()),
        ServeRequest::List => return ServeResponse::data(service.list_jobs().await),
        ServeRequest::Create(req) => service.create_job(req).await,
        ServeRequest::Get { id, cursor } => service.get_job(&id, cursor).await,
        ServeRequest::Terminate { id, cursor } => service.terminate_job(&id, cursor).await,
    };
    match result {
        Ok(snapshot) => ServeResponse::data(snapshot),
        Err(e) => e.into(),
    }
}

/// JSON 行服务：stdin 结束或收到信号时退出，退出前终止所有未结束的作业
async fn serve(service: JobService) -> anyhow::Result<()> {
    let jobs = Arc::clone(service.manager());
    jobs.start_cleanup_task().await;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator =
        ShutdownCoordinator::new().with_timeout(jobs.config().cancel_grace + CLEANUP_MARGIN);
    coordinator.register(JobManagerCleanup::new(jobs));

    let app = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read request");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = handle_request(&service, &line).await;
            let mut out = match serde_json::to_string(&response) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode response");
                    continue;
                }
            };
            out.push('\n');
            if stdout.write_all(out.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    };

    tracing::info!("Serving JSON requests on stdin");
    run_with_graceful_shutdown(shutdown, app, || coordinator.run_cleanup()).await;
    Ok(())
}
