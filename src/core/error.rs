//! 错误类型
//!
//! 容量与未找到错误同步返回给调用方；执行任务内部的失败（启动失败、读取失败、等待失败）
//! 不走这里，而是转成作业的 error 状态与系统日志。

use std::path::PathBuf;

use thiserror::Error;

/// JobManager 操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// 无空闲槽位且排队已满；不修改任何状态，可稍后重试
    #[error("Job queue is full (limit {queue_limit}), retry later")]
    Rejected { queue_limit: usize },

    #[error("Job not found: {0}")]
    NotFound(String),
}

/// 动作目录加载错误
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Duplicate action id: {0}")]
    DuplicateAction(String),

    #[error("Action '{0}' has an empty command")]
    EmptyCommand(String),
}

/// 调用边界（CLI / API / 测试）的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ServiceError {
    /// 供外部展示层映射状态码的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownAction(_) => "unknown_action",
            Self::Job(JobError::Rejected { .. }) => "rejected",
            Self::Job(JobError::NotFound(_)) => "not_found",
        }
    }
}
