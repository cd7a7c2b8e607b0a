//! 动作目录：向引擎提供不可变的 ActionDefinition
//!
//! 目录是外部协作方，引擎只通过 ActionCatalog trait 查询；StaticCatalog 是按声明顺序保存的内存实现，
//! 可由 TOML 文件加载（见 loader）。

mod loader;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::CatalogError;
use crate::jobs::ActionDefinition;

pub use loader::{load_catalog, parse_catalog, DEFAULT_CATALOG_PATHS};

/// 动作目录 trait
pub trait ActionCatalog: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<ActionDefinition>>;

    /// 按声明顺序返回全部动作
    fn list(&self) -> Vec<Arc<ActionDefinition>>;
}

/// 内存目录：保持声明顺序，按 id 索引
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    actions: Vec<Arc<ActionDefinition>>,
    index: HashMap<String, usize>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册动作；id 重复或命令为空时报错
    pub fn register(&mut self, action: ActionDefinition) -> Result<(), CatalogError> {
        if action.command.is_empty() {
            return Err(CatalogError::EmptyCommand(action.id));
        }
        if self.index.contains_key(&action.id) {
            return Err(CatalogError::DuplicateAction(action.id));
        }
        self.index.insert(action.id.clone(), self.actions.len());
        self.actions.push(Arc::new(action));
        Ok(())
    }

    pub fn from_actions(
        actions: impl IntoIterator<Item = ActionDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for action in actions {
            catalog.register(action)?;
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl ActionCatalog for StaticCatalog {
    fn get(&self, id: &str) -> Option<Arc<ActionDefinition>> {
        self.index.get(id).map(|&i| Arc::clone(&self.actions[i]))
    }

    fn list(&self) -> Vec<Arc<ActionDefinition>> {
        self.actions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str) -> ActionDefinition {
        ActionDefinition::new(id, id.to_uppercase(), vec!["echo".into(), id.into()])
    }

    #[test]
    fn test_register_and_lookup_keeps_order() {
        let catalog = StaticCatalog::from_actions([action("b"), action("a"), action("c")]).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("a").map(|a| a.title.clone()), Some("A".to_string()));
        assert!(catalog.get("zzz").is_none());

        let ids: Vec<_> = catalog.list().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_rejects_duplicate_and_empty_command() {
        let mut catalog = StaticCatalog::new();
        catalog.register(action("a")).unwrap();
        assert!(matches!(
            catalog.register(action("a")),
            Err(CatalogError::DuplicateAction(id)) if id == "a"
        ));
        assert!(matches!(
            catalog.register(ActionDefinition::new("empty", "Empty", vec![])),
            Err(CatalogError::EmptyCommand(_))
        ));
        assert_eq!(catalog.len(), 1);
    }
}
