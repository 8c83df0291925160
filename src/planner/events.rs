//! 规划器过程事件：通过 SSE 推送节点开始/结束、模型调用、工具调用、决策与错误

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// 事件类型（SSE 的 event 名即 as_str）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Ready,
    Heartbeat,
    NodeStart,
    NodeEnd,
    LlmCall,
    ToolCall,
    ToolResult,
    Decision,
    Error,
    PlannerState,
    Message,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Ready => "ready",
            EventType::Heartbeat => "heartbeat",
            EventType::NodeStart => "node_start",
            EventType::NodeEnd => "node_end",
            EventType::LlmCall => "llm_call",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::Decision => "decision",
            EventType::Error => "error",
            EventType::PlannerState => "planner_state",
            EventType::Message => "message",
        }
    }

    /// ready / heartbeat 只表示连接存活，不属于规划节点
    pub fn is_liveness(&self) -> bool {
        matches!(self, EventType::Ready | EventType::Heartbeat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Success,
    Error,
}

/// 单条事件；发布后不再修改
#[derive(Debug, Clone, Serialize)]
pub struct PlannerEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// ISO-8601
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PlannerEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            node: None,
            status: None,
            message: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data: None,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn ready(session_id: &str) -> Self {
        Self::new(EventType::Ready)
            .with_status(EventStatus::Success)
            .with_data(serde_json::json!({ "sessionId": session_id, "status": "ready" }))
    }

    pub fn heartbeat(session_id: &str) -> Self {
        Self::new(EventType::Heartbeat)
            .with_data(serde_json::json!({ "sessionId": session_id, "status": "idle" }))
    }

    /// SSE data 行使用的 JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
