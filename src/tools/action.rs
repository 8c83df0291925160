//! 动作记录：每轮追加写入的决策 / 工具调用 / 工具结果

use serde::{Deserialize, Serialize};

/// 可调度的工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolName {
    Calc,
    Products,
    Outlets,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Calc => "calc",
            ToolName::Products => "products",
            ToolName::Outlets => "outlets",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "calc" | "calculator" => Some(ToolName::Calc),
            "products" | "product_search" => Some(ToolName::Products),
            "outlets" | "outlet_query" => Some(ToolName::Outlets),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Decision,
    ToolCall,
    ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
}

/// 统一动作记录（响应里的 actions 数组元素）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub tool: Option<ToolName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolAction {
    pub fn decision(status: ActionStatus, message: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Decision,
            tool: None,
            args: None,
            status: Some(status),
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn tool_call(tool: ToolName, args: serde_json::Value) -> Self {
        Self {
            kind: ActionKind::ToolCall,
            tool: Some(tool),
            args: Some(args),
            status: None,
            data: None,
            message: None,
        }
    }

    pub fn tool_success(tool: ToolName, data: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::ToolResult,
            tool: Some(tool),
            args: None,
            status: Some(ActionStatus::Success),
            data: Some(data),
            message: Some(message.into()),
        }
    }

    pub fn tool_error(tool: ToolName, data: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::ToolResult,
            tool: Some(tool),
            args: None,
            status: Some(ActionStatus::Error),
            data: Some(data),
            message: Some(message.into()),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(ActionStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_action_wire_shape() {
        let a = ToolAction::tool_call(ToolName::Calc, serde_json::json!({"expression": "1+1"}));
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["tool"], "calc");
        assert!(v.get("status").is_none());

        let d = ToolAction::decision(ActionStatus::Success, "asked");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["type"], "decision");
        assert!(v["tool"].is_null());
        assert_eq!(v["status"], "success");
    }

    #[test]
    fn test_tool_name_parse_aliases() {
        assert_eq!(ToolName::parse("Calculator"), Some(ToolName::Calc));
        assert_eq!(ToolName::parse("outlets"), Some(ToolName::Outlets));
        assert_eq!(ToolName::parse("weather"), None);
    }
}
