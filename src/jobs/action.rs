//! 动作定义：可执行命令模板 + 可勾选的参数选项
//!
//! ActionDefinition 由外部目录（ActionCatalog）提供，创建后不可变；
//! 解析默认参数是纯函数，不涉及任何进程执行。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::process::shell_join;

/// 动作选项：被选中时追加的参数 token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// 默认勾选的选项会并入 default_arguments()
    #[serde(default, alias = "default_selected")]
    pub default_selected: bool,
}

/// 动作定义（对应目录文件中的一个 [[actions]] 表）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionDefinition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 可执行文件 + 基础参数
    pub command: Vec<String>,
    #[serde(default)]
    pub default_args: Vec<String>,
    #[serde(default)]
    pub options: Vec<ActionOption>,
    /// 覆盖宿主环境的变量
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl ActionDefinition {
    pub fn new(id: impl Into<String>, title: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            command,
            default_args: Vec::new(),
            options: Vec::new(),
            env: BTreeMap::new(),
            hint: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_default_args(mut self, args: Vec<String>) -> Self {
        self.default_args = args;
        self
    }

    pub fn with_option(mut self, option: ActionOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// default_args + 所有默认勾选选项的 args（按声明顺序）
    pub fn default_arguments(&self) -> Vec<String> {
        let mut parts = self.default_args.clone();
        for option in self.options.iter().filter(|o| o.default_selected) {
            parts.extend(option.args.iter().cloned());
        }
        parts
    }

    /// 默认调用的预览（shell 转义）
    pub fn display_command(&self) -> String {
        let parts: Vec<String> = self
            .command
            .iter()
            .cloned()
            .chain(self.default_arguments())
            .collect();
        shell_join(&parts)
    }
}

/// 调用方对参数的选择
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum JobArgs {
    /// 使用动作的默认参数
    #[default]
    Defaults,
    /// 完全替换默认参数
    Override(Vec<String>),
    /// 默认参数之后追加
    Extend(Vec<String>),
}

impl JobArgs {
    /// 边界层的习惯写法：args 优先，否则默认参数 + extra_args
    pub fn from_request(args: Option<Vec<String>>, extra_args: Vec<String>) -> Self {
        match args {
            Some(args) => Self::Override(args),
            None if extra_args.is_empty() => Self::Defaults,
            None => Self::Extend(extra_args),
        }
    }

    /// 解析出最终追加到 command 之后的参数
    pub fn resolve(&self, action: &ActionDefinition) -> Vec<String> {
        match self {
            Self::Defaults => action.default_arguments(),
            Self::Override(args) => args.clone(),
            Self::Extend(extra) => {
                let mut parts = action.default_arguments();
                parts.extend(extra.iter().cloned());
                parts
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(id: &str, args: &[&str], default_selected: bool) -> ActionOption {
        ActionOption {
            id: id.to_string(),
            label: id.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            description: String::new(),
            default_selected,
        }
    }

    fn sync_action() -> ActionDefinition {
        ActionDefinition::new(
            "pull",
            "同步需求",
            vec!["python3".into(), "scripts/sync".into()],
        )
        .with_default_args(vec!["--execute".into()])
        .with_option(option("owner", &["--owner", "前端"], false))
        .with_option(option("current-iteration", &["--current-iteration"], true))
        .with_option(option("limit", &["--limit", "20"], true))
    }

    #[test]
    fn test_default_arguments_follow_declaration_order() {
        let action = sync_action();
        assert_eq!(
            action.default_arguments(),
            vec!["--execute", "--current-iteration", "--limit", "20"]
        );
        // 纯函数：多次调用结果一致
        assert_eq!(action.default_arguments(), action.default_arguments());
    }

    #[test]
    fn test_display_command_quotes_tokens() {
        let action = ActionDefinition::new("x", "x", vec!["echo".into()])
            .with_default_args(vec!["hello world".into(), "it's".into()]);
        assert_eq!(action.display_command(), "echo 'hello world' 'it'\"'\"'s'");
    }

    #[test]
    fn test_job_args_resolution() {
        let action = sync_action();
        assert_eq!(JobArgs::Defaults.resolve(&action), action.default_arguments());
        assert_eq!(
            JobArgs::Override(vec!["--dry-run".into()]).resolve(&action),
            vec!["--dry-run"]
        );
        assert_eq!(
            JobArgs::Extend(vec!["--ids".into(), "1,2".into()]).resolve(&action),
            vec!["--execute", "--current-iteration", "--limit", "20", "--ids", "1,2"]
        );
    }

    #[test]
    fn test_from_request_prefers_override() {
        assert_eq!(
            JobArgs::from_request(Some(vec![]), vec!["--x".into()]),
            JobArgs::Override(vec![])
        );
        assert_eq!(JobArgs::from_request(None, vec![]), JobArgs::Defaults);
        assert_eq!(
            JobArgs::from_request(None, vec!["--x".into()]),
            JobArgs::Extend(vec!["--x".into()])
        );
    }
}
