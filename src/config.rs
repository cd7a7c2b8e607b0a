//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `JOBHIVE__*` 覆盖（双下划线表示嵌套，如 `JOBHIVE__JOBS__MAX_CONCURRENT=4`）。
//! 兼容旧部署的扁平变量 `JOB_MAX_CONCURRENT` / `JOB_QUEUE_LIMIT` / `JOB_RETENTION_SECONDS` /
//! `JOB_CLEANUP_INTERVAL_SECONDS`：负数按 0 处理，无法解析时忽略。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::jobs::JobManagerConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub catalog: CatalogSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [jobs] 段：并发、排队、保留与终止宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct JobsSection {
    /// 0 = 不限并发
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 0 = 不限排队长度
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    /// 0 = 不清理
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
    /// 0 = 不启动定时清理（顺带清理仍会执行）
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// SIGTERM 之后等待多久升级为 SIGKILL
    #[serde(default = "default_cancel_grace_millis")]
    pub cancel_grace_millis: u64,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_queue_limit() -> usize {
    50
}

fn default_retention_seconds() -> u64 {
    3600
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

fn default_max_log_lines() -> usize {
    2000
}

fn default_cancel_grace_millis() -> u64 {
    5000
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_limit: default_queue_limit(),
            retention_seconds: default_retention_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            max_log_lines: default_max_log_lines(),
            cancel_grace_millis: default_cancel_grace_millis(),
        }
    }
}

impl JobsSection {
    pub fn manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            max_concurrent: self.max_concurrent,
            queue_limit: self.queue_limit,
            retention: Duration::from_secs(self.retention_seconds),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            max_log_lines: self.max_log_lines,
            cancel_grace: Duration::from_millis(self.cancel_grace_millis),
        }
    }
}

/// [catalog] 段：动作目录文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CatalogSection {
    /// 未设置时依次查找 config/actions.toml、../config/actions.toml
    pub path: Option<PathBuf>,
}

/// 扁平环境变量 → 配置键
const LEGACY_JOB_VARS: &[(&str, &str)] = &[
    ("JOB_MAX_CONCURRENT", "jobs.max_concurrent"),
    ("JOB_QUEUE_LIMIT", "jobs.queue_limit"),
    ("JOB_RETENTION_SECONDS", "jobs.retention_seconds"),
    ("JOB_CLEANUP_INTERVAL_SECONDS", "jobs.cleanup_interval_seconds"),
];

/// 负数按 0，非整数忽略
fn parse_legacy_value(name: &str, raw: &str) -> Option<i64> {
    match raw.trim().parse::<i64>() {
        Ok(v) => Some(v.max(0)),
        Err(_) => {
            tracing::warn!(variable = name, value = raw, "ignoring non-integer job setting");
            None
        }
    }
}

/// 从 config 目录加载配置，环境变量可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 JOBHIVE__*（双下划线表示嵌套键）
/// 4. 最后叠加扁平的 JOB_* 变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("JOBHIVE")
            .separator("__")
            .try_parsing(true),
    );

    for (name, key) in LEGACY_JOB_VARS {
        let value = std::env::var(name)
            .ok()
            .and_then(|raw| parse_legacy_value(name, &raw));
        builder = builder.set_override_option(*key, value)?;
    }

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.jobs.manager_config(), JobManagerConfig::default());
    }

    #[test]
    fn test_parse_legacy_value() {
        assert_eq!(parse_legacy_value("X", "4"), Some(4));
        assert_eq!(parse_legacy_value("X", " -3 "), Some(0));
        assert_eq!(parse_legacy_value("X", "abc"), None);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[jobs]\nmax_concurrent = 5\ncancel_grace_millis = 250\n\n[catalog]\npath = \"actions.toml\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.jobs.max_concurrent, 5);
        assert_eq!(cfg.jobs.queue_limit, 50);
        assert_eq!(
            cfg.jobs.manager_config().cancel_grace,
            Duration::from_millis(250)
        );
        assert_eq!(cfg.catalog.path, Some(PathBuf::from("actions.toml")));
    }
}
