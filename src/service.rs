//! 调用边界：创建 / 列出 / 查询 / 终止作业，以及动作列表
//!
//! 供外部展示层（HTTP API、CLI、测试）使用；返回可直接序列化的 camelCase 载荷。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ActionCatalog;
use crate::core::ServiceError;
use crate::jobs::{ActionDefinition, ActionOption, Job, JobArgs, JobManager, JobStatus, LogEntry};

/// 创建作业请求：args 为完整覆盖，否则默认参数 + extra_args
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub action_id: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl CreateJobRequest {
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            ..Default::default()
        }
    }
}

/// 作业详情 + 游标之后的日志
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub action_id: String,
    pub title: String,
    pub status: JobStatus,
    pub command: Vec<String>,
    pub display_command: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub cancel_requested: bool,
    pub logs: Vec<LogEntry>,
    /// 调用时的最大日志序号，下次轮询的游标
    pub next_cursor: u64,
}

impl JobSnapshot {
    pub async fn capture(job: &Job, cursor: i64) -> Self {
        let state = job.state().await;
        let (logs, next_cursor) = job.collect_logs(cursor).await;
        Self {
            id: job.id().to_string(),
            action_id: job.action().id.clone(),
            title: job.action().title.clone(),
            status: state.status,
            command: job.command().to_vec(),
            display_command: job.display_command(),
            created_at: job.created_at(),
            started_at: state.started_at,
            finished_at: state.finished_at,
            exit_code: state.exit_code,
            cancel_requested: state.cancel_requested,
            logs,
            next_cursor,
        }
    }
}

/// 作业列表项
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub action_id: String,
    pub title: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl JobSummary {
    pub async fn capture(job: &Job) -> Self {
        let state = job.state().await;
        Self {
            id: job.id().to_string(),
            action_id: job.action().id.clone(),
            title: job.action().title.clone(),
            status: state.status,
            created_at: job.created_at(),
            finished_at: state.finished_at,
            exit_code: state.exit_code,
        }
    }
}

/// 动作列表项（含默认调用预览）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPayload {
    pub id: String,
    pub title: String,
    pub description: String,
    pub default_args: Vec<String>,
    pub command_preview: String,
    pub hint: Option<String>,
    pub options: Vec<ActionOption>,
}

impl From<&ActionDefinition> for ActionPayload {
    fn from(action: &ActionDefinition) -> Self {
        Self {
            id: action.id.clone(),
            title: action.title.clone(),
            description: action.description.clone(),
            default_args: action.default_args.clone(),
            command_preview: action.display_command(),
            hint: action.hint.clone(),
            options: action.options.clone(),
        }
    }
}

/// 作业服务：目录 + 管理器
#[derive(Clone)]
pub struct JobService {
    catalog: Arc<dyn ActionCatalog>,
    manager: Arc<JobManager>,
}

impl JobService {
    pub fn new(catalog: Arc<dyn ActionCatalog>, manager: Arc<JobManager>) -> Self {
        Self { catalog, manager }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn list_actions(&self) -> Vec<ActionPayload> {
        self.catalog
            .list()
            .iter()
            .map(|a| ActionPayload::from(a.as_ref()))
            .collect()
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> Result<JobSnapshot, ServiceError> {
        let action = self
            .catalog
            .get(&request.action_id)
            .ok_or_else(|| ServiceError::UnknownAction(request.action_id.clone()))?;
        let args = JobArgs::from_request(request.args, request.extra_args);
        let job = self.manager.create(action, args).await?;
        Ok(JobSnapshot::capture(&job, 0).await)
    }

    pub async fn list_jobs(&self) -> Vec<JobSummary> {
        let mut summaries = Vec::new();
        for job in self.manager.list().await {
            summaries.push(JobSummary::capture(&job).await);
        }
        summaries
    }

    pub async fn get_job(&self, id: &str, cursor: i64) -> Result<JobSnapshot, ServiceError> {
        let job = self.manager.get(id).await?;
        Ok(JobSnapshot::capture(&job, cursor).await)
    }

    pub async fn terminate_job(&self, id: &str, cursor: i64) -> Result<JobSnapshot, ServiceError> {
        let job = self.manager.terminate(id).await?;
        Ok(JobSnapshot::capture(&job, cursor).await)
    }
}
