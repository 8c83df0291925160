//! 工具调度器
//!
//! 持有 ToolRegistry 与各工具的截止时间；execute(tool, args) 在超时内调用工具，
//! 结果统一转为 ToolAction（失败为 status=error，不向上抛）。调用前后发布 tool_call / tool_result 事件，
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::event_stream::{send_event, SessionEmitter};
use crate::core::ToolError;
use crate::planner::{EventStatus, EventType, PlannerEvent};
use crate::tools::{ToolAction, ToolName, ToolRegistry};

/// 各工具的截止时间
#[derive(Debug, Clone, Copy)]
pub struct ToolTimeouts {
    pub calc: Duration,
    pub products: Duration,
    pub outlets: Duration,
}

impl ToolTimeouts {
    pub fn for_tool(&self, tool: ToolName) -> Duration {
        match tool {
            ToolName::Calc => self.calc,
            ToolName::Products => self.products,
            ToolName::Outlets => self.outlets,
        }
    }
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            calc: Duration::from_secs(5),
            products: Duration::from_secs(8),
            outlets: Duration::from_secs(8),
        }
    }
}

pub struct ToolDispatcher {
    registry: ToolRegistry,
    timeouts: ToolTimeouts,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeouts: ToolTimeouts) -> Self {
        Self { registry, timeouts }
    }

    pub fn tool_names(&self) -> Vec<ToolName> {
        self.registry.tool_names()
    }

    /// 执行工具，返回 tool_result 动作
    pub async fn execute(
        &self,
        tool: ToolName,
        args: Value,
        events: Option<&SessionEmitter>,
    ) -> ToolAction {
        send_event(
            events,
            PlannerEvent::new(EventType::ToolCall)
                .with_node("tool_call")
                .with_status(EventStatus::Pending)
                .with_message(format!("Calling {tool}"))
                .with_data(json!({ "tool": tool, "args": args })),
        );

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let deadline = self.timeouts.for_tool(tool);
        let result = match self.registry.get(tool) {
            Some(handler) => match timeout(deadline, handler.execute(args)).await {
                Ok(r) => r,
                Err(_) => Err(ToolError::UpstreamTimeout(format!(
                    "{tool} exceeded {} ms",
                    deadline.as_millis()
                ))),
            },
            None => Err(ToolError::ProviderUnavailable(format!("{tool} is not configured"))),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        let audit = json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": elapsed_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(output) => {
                send_event(
                    events,
                    PlannerEvent::new(EventType::ToolResult)
                        .with_node("tool_call")
                        .with_status(EventStatus::Success)
                        .with_message(output.message.clone())
                        .with_data(json!({ "tool": tool, "elapsedMs": elapsed_ms })),
                );
                ToolAction::tool_success(tool, output.data, output.message)
            }
            Err(err) => {
                if let ToolError::SafetyViolation(detail) = &err {
                    tracing::warn!(tool = %tool, violation = %detail, "query rejected by safety gate");
                }
                send_event(
                    events,
                    PlannerEvent::new(EventType::ToolResult)
                        .with_node("tool_call")
                        .with_status(EventStatus::Error)
                        .with_message(err.user_message())
                        .with_data(json!({
                            "tool": tool,
                            "elapsedMs": elapsed_ms,
                            "errorType": err.kind(),
                            "detail": err.to_string(),
                        })),
                );
                ToolAction::tool_error(
                    tool,
                    json!({ "errorType": err.kind() }),
                    err.user_message(),
                )
            }
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_stream::SessionEventStream;
    use crate::core::session::SessionRegistry;
    use crate::tools::{Tool, ToolOutput};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::Arc;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> ToolName {
            ToolName::Products
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::new(json!([]), "late"))
        }
    }

    struct RejectingTool;

    #[async_trait]
    impl Tool for RejectingTool {
        fn name(&self) -> ToolName {
            ToolName::Outlets
        }
        fn description(&self) -> &str {
            "always rejected"
        }
        async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
            Err(ToolError::SafetyViolation("forbidden keyword DROP".into()))
        }
    }

    fn dispatcher() -> ToolDispatcher {
        let mut reg = ToolRegistry::new();
        reg.register(SlowTool);
        reg.register(RejectingTool);
        ToolDispatcher::new(
            reg,
            ToolTimeouts {
                products: Duration::from_millis(20),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_action() {
        let action = dispatcher().execute(ToolName::Products, json!({}), None).await;
        assert!(!action.is_success());
        assert_eq!(action.data.unwrap()["errorType"], "upstream_timeout");
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_unavailable() {
        let action = dispatcher().execute(ToolName::Calc, json!({}), None).await;
        assert_eq!(action.data.unwrap()["errorType"], "provider_unavailable");
    }

    #[tokio::test]
    async fn test_safety_detail_only_in_event() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let events = Arc::new(SessionEventStream::new(registry, Duration::from_secs(30)));
        let mut sub = events.subscribe("s1");
        sub.next().await;
        let emitter = events.emitter("s1");

        let action = dispatcher()
            .execute(ToolName::Outlets, json!({"query": "x"}), Some(&emitter))
            .await;
        assert!(!action.message.clone().unwrap().contains("DROP"));

        let call = sub.next().await.unwrap();
        assert_eq!(call.event_type, EventType::ToolCall);
        assert_eq!(call.status, Some(EventStatus::Pending));
        let result = sub.next().await.unwrap();
        assert_eq!(result.event_type, EventType::ToolResult);
        let data = result.data.unwrap();
        assert!(data["detail"].as_str().unwrap().contains("DROP"));
        assert!(data.get("elapsedMs").is_some());
    }
}
