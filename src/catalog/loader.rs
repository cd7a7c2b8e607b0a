//! 从 TOML 加载动作目录
//!
//! ```toml
//! [[actions]]
//! id = "pull-to-notion"
//! title = "同步需求到 Notion"
//! command = ["python3", "scripts/sync"]
//! default_args = ["--execute"]
//!
//! [actions.env]
//! LOG_LEVEL = "INFO"
//!
//! [[actions.options]]
//! id = "current-iteration"
//! label = "--current-iteration"
//! args = ["--current-iteration"]
//! default_selected = true
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::StaticCatalog;
use crate::core::CatalogError;
use crate::jobs::ActionDefinition;

/// 未显式指定路径时依次查找的位置
pub const DEFAULT_CATALOG_PATHS: &[&str] = &["config/actions.toml", "../config/actions.toml"];

#[derive(Debug, Deserialize)]
struct CatalogToml {
    #[serde(default)]
    actions: Vec<ActionDefinition>,
}

/// 解析目录文本
pub fn parse_catalog(content: &str) -> Result<StaticCatalog, CatalogError> {
    let parsed: CatalogToml = toml::from_str(content)?;
    StaticCatalog::from_actions(parsed.actions)
}

/// 读取目录文件；path 为 None 时查找默认位置，都不存在则返回空目录
pub fn load_catalog(path: Option<&Path>) -> Result<StaticCatalog, CatalogError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match DEFAULT_CATALOG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
        {
            Some(p) => p,
            None => {
                tracing::warn!("No action catalog found, starting with an empty catalog");
                return Ok(StaticCatalog::new());
            }
        },
    };

    let content = std::fs::read_to_string(&path).map_err(|source| CatalogError::Io {
        path: path.clone(),
        source,
    })?;
    let catalog = parse_catalog(&content)?;
    tracing::info!(path = %path.display(), "Loaded {} actions", catalog.len());
    Ok(catalog)
}
