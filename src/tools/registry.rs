//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找，
//! ToolDispatcher 在调用时加超时并统一转为 ToolAction。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::ToolName;

/// 工具执行成功的输出：结构化数据 + 面向用户的一句话摘要
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub data: Value,
    pub message: String,
}

impl ToolOutput {
    pub fn new(data: Value, message: impl Into<String>) -> Self {
        Self {
            data,
            message: message.into(),
        }
    }
}

/// 工具 trait：名称、描述、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> ToolName;

    /// 工具描述（写入日志与提示词）
    fn description(&self) -> &str;

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

/// 工具注册表：按 ToolName 存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<ToolName, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: ToolName) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name).cloned()
    }

    pub fn tool_names(&self) -> Vec<ToolName> {
        let mut names: Vec<ToolName> = self.tools.keys().copied().collect();
        names.sort_by_key(|n| n.as_str());
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(ToolName, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|n| self.tools.get(&n).map(|t| (n, t.description().to_string())))
            .collect()
    }
}

/// 读取字符串参数（去首尾空白，空串视为缺失）
pub fn string_arg(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| args.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed;

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> ToolName {
            ToolName::Calc
        }
        fn description(&self) -> &str {
            "fixed"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(json!(1), "one"))
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Fixed);
        assert_eq!(reg.tool_names(), vec![ToolName::Calc]);
        assert!(reg.get(ToolName::Outlets).is_none());
        let out = reg.get(ToolName::Calc).unwrap().execute(json!({})).await.unwrap();
        assert_eq!(out.message, "one");
    }

    #[test]
    fn test_string_arg() {
        let args = json!({"query": "  ", "expression": " 1+1 "});
        assert_eq!(string_arg(&args, &["query", "expression"]).as_deref(), Some("1+1"));
        assert_eq!(string_arg(&args, &["missing"]), None);
    }
}
