//! 作业编排引擎：动作 → 受监管的外部进程执行
//!
//! - **action**: 动作定义与参数选择（纯值对象）
//! - **log_store**: 有界日志与游标读取
//! - **process**: 进程构建、输出读取、信号
//! - **job**: 单次执行的状态机与取消升级
//! - **manager**: 准入、排队、终止、过期清理

pub mod action;
pub mod job;
pub mod log_store;
pub mod manager;
pub mod process;

pub use action::{ActionDefinition, ActionOption, JobArgs};
pub use job::{Job, JobId, JobState, JobStatus, DEFAULT_CANCEL_GRACE, NOT_RUN_EXIT_CODE};
pub use log_store::{LogEntry, LogStore, LogStream, DEFAULT_MAX_LOG_LINES};
pub use manager::{JobManager, JobManagerConfig};
pub use process::ProcessSignal;
