//! JobHive - 本地命令作业编排引擎
//!
//! 模块划分：
//! - **catalog**: 动作目录（ActionCatalog trait + TOML 加载）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **jobs**: 作业模型、日志窗口、子进程监管、并发与排队管理
//! - **observability**: tracing 初始化
//! - **service**: 调用边界（创建 / 列出 / 查询 / 终止）与序列化载荷

pub mod catalog;
pub mod config;
pub mod core;
pub mod jobs;
pub mod observability;
pub mod service;

pub use catalog::{ActionCatalog, StaticCatalog};
pub use jobs::{JobManager, JobManagerConfig};
pub use service::JobService;
