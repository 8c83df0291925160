//! 回复合成的确定性部分：工具摘要、规则模板、追问兜底与道歉文案
//!
//! 模型可用时由 synthesis 提示词改写；模型不可用、失败或预算用尽时使用这里的模板。

use crate::llm::LlmError;
use crate::planner::Intent;
use crate::tools::{ActionKind, ToolAction};

pub const AGGREGATION_NOTE: &str = "Note: User asked for a product count/aggregate. Product search only returns a limited sample; do not claim an exact catalog-wide number.";

const ASSISTANT_SCOPE: &str =
    "I'm the ZUS Coffee assistant for calculator checks, drinkware finds, and outlet guidance";

fn tool_results(actions: &[ToolAction]) -> impl Iterator<Item = &ToolAction> {
    actions.iter().filter(|a| a.kind == ActionKind::ToolResult)
}

/// 供 decision / synthesis 提示词使用的工具结果摘要；每条结果一行 `- [tool] status: message`，
/// 其后缩进一行为结果数据
pub fn build_tool_summary(actions: &[ToolAction], aggregation: bool) -> String {
    let mut lines = Vec::new();
    if aggregation {
        lines.push(AGGREGATION_NOTE.to_string());
    }
    for action in tool_results(actions) {
        let tool = action.tool.map(|t| t.as_str()).unwrap_or("unknown");
        let status = if action.is_success() { "success" } else { "error" };
        let message = action.message.as_deref().unwrap_or("");
        lines.push(format!("- [{tool}] {status}: {message}"));
        if let Some(data) = &action.data {
            lines.push(format!("  data: {data}"));
        }
    }
    if lines.is_empty() {
        return "none".to_string();
    }
    lines.join("\n")
}

/// 本轮已成功的工具结果消息
pub fn successful_messages(actions: &[ToolAction]) -> Vec<&str> {
    tool_results(actions)
        .filter(|a| a.is_success())
        .filter_map(|a| a.message.as_deref())
        .collect()
}

/// 模型不可用时的规则回复：取本轮最后一次工具结果
pub fn rule_based_message(actions: &[ToolAction]) -> String {
    match tool_results(actions).last() {
        Some(action) if action.is_success() => action
            .message
            .clone()
            .unwrap_or_else(|| default_message().to_string()),
        Some(action) => {
            let kind = action
                .data
                .as_ref()
                .and_then(|d| d.get("errorType"))
                .and_then(|v| v.as_str())
                .unwrap_or("tool_error");
            let detail = action.message.as_deref().unwrap_or("");
            format!(
                "{ASSISTANT_SCOPE}, but something went wrong ({kind}). {detail} Please try again or clarify your request."
            )
        }
        None => default_message().to_string(),
    }
}

fn default_message() -> &'static str {
    "I'm the ZUS Coffee assistant who can use a calculator, suggest drinkware, and locate outlets. Could you share a bit more so I can point you to the right tool?"
}

/// 闲聊的兜底回复
pub fn small_talk_message() -> &'static str {
    "Hi there! I can help with drinkware, outlet opening hours, or quick calculations."
}

/// 预算用尽：说明结果不完整，附上已有的部分结果
pub fn budget_exhausted_message(actions: &[ToolAction]) -> String {
    let partial = successful_messages(actions);
    if partial.is_empty() {
        return "I reached the step limit for this request before I could finish. Please try again or ask a narrower question.".to_string();
    }
    format!(
        "I reached the step limit for this request, so this answer may be incomplete. Here is what I found so far: {}",
        partial.join(" ")
    )
}

/// 规划阶段模型失败时的道歉
pub fn apology_message(err: &LlmError) -> String {
    let base = "Sorry, I couldn't work out how to handle that request right now.";
    match err {
        LlmError::Unavailable(_) => format!("{base} The assistant service is unreachable, please try again shortly."),
        LlmError::Timeout(_) => format!("{base} The assistant took too long to respond, please try again."),
        _ => format!("{base} Could you rephrase it?"),
    }
}

/// 追问模型不可用时按意图给出的追问
pub fn fallback_follow_up(intent: Intent) -> &'static str {
    match intent {
        Intent::Calculation => "I can help calculate it. Could you share the full expression?",
        Intent::ProductQuery => "Which drinkware item or style are you looking for?",
        Intent::OutletQuery => "Which outlet or area should I check?",
        Intent::SmallTalk | Intent::Ambiguous => "Could you clarify what you need help with?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ActionStatus, ToolName};
    use serde_json::json;

    fn calc_ok() -> ToolAction {
        ToolAction::tool_success(
            ToolName::Calc,
            json!({"expression": "5+10", "result": 15}),
            "The result for `5+10` is **15**.",
        )
    }

    fn outlets_err() -> ToolAction {
        ToolAction::tool_error(
            ToolName::Outlets,
            json!({"errorType": "upstream_timeout"}),
            "The service took too long to respond.",
        )
    }

    #[test]
    fn test_tool_summary_lines() {
        assert_eq!(build_tool_summary(&[], false), "none");
        let actions = vec![
            ToolAction::decision(ActionStatus::Success, "call calc"),
            ToolAction::tool_call(ToolName::Calc, json!({"expression": "5+10"})),
            calc_ok(),
        ];
        let summary = build_tool_summary(&actions, false);
        assert!(summary.starts_with("- [calc] success: The result for `5+10` is **15**."));
        assert!(summary.contains("  data: {\"expression\":\"5+10\",\"result\":15}"));
        assert!(build_tool_summary(&[], true).starts_with("Note:"));
    }

    #[test]
    fn test_rule_based_message_uses_last_result() {
        assert_eq!(rule_based_message(&[calc_ok()]), "The result for `5+10` is **15**.");
        let msg = rule_based_message(&[calc_ok(), outlets_err()]);
        assert!(msg.contains("(upstream_timeout)"));
        assert!(msg.ends_with("Please try again or clarify your request."));
        assert!(rule_based_message(&[]).contains("share a bit more"));
    }

    #[test]
    fn test_budget_message_mentions_partial_results() {
        let msg = budget_exhausted_message(&[calc_ok(), outlets_err()]);
        assert!(msg.contains("may be incomplete"));
        assert!(msg.contains("**15**"));
        assert!(!budget_exhausted_message(&[]).contains("found so far"));
    }

    #[test]
    fn test_apology_for_unavailable_provider() {
        let msg = apology_message(&LlmError::Unavailable("connection refused".into()));
        assert!(msg.contains("please try again shortly"));
        assert!(!apology_message(&LlmError::Provider("500".into())).contains("shortly"));
    }
}
