//! 会话级对话状态
//!
//! 跨轮次保留：最近意图与槽位、上一次工具结果、门店追问上下文、上一轮动作日志。
//! 作为响应中的 memory 字段返回；会话重置时整体清空。

use serde::Serialize;

use crate::memory::{Message, Role};
use crate::planner::{Intent, Slots};
use crate::tools::{ToolAction, ToolName};

/// 最近一次工具失败
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorState {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// 会话内保留的门店结果快照上限
const MAX_OUTLETS_SNAPSHOTS: usize = 16;

/// 一次成功的门店查询，以产生它的（用户问题，助手回复）为键
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletsSnapshot {
    pub question: String,
    pub reply: String,
    pub result: serde_json::Value,
}

/// 门店追问上下文
///
/// 快照只在客户端提交的历史里仍包含对应问答时才生效，
/// 因此同一份历史无论提交几次，追问增强的结果都相同。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletsContext {
    pub last_raw_question: Option<String>,
    pub last_enriched_query: Option<String>,
    #[serde(skip)]
    pub snapshots: Vec<OutletsSnapshot>,
}

impl OutletsContext {
    pub fn remember(&mut self, snapshot: OutletsSnapshot) {
        self.snapshots
            .retain(|s| !(s.question == snapshot.question && s.reply == snapshot.reply));
        self.snapshots.push(snapshot);
        if self.snapshots.len() > MAX_OUTLETS_SNAPSHOTS {
            let excess = self.snapshots.len() - MAX_OUTLETS_SNAPSHOTS;
            self.snapshots.drain(..excess);
        }
    }

    pub fn lookup(&self, question: &str, reply: &str) -> Option<&OutletsSnapshot> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.question == question && s.reply == reply)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub intent: Option<Intent>,
    pub slots: Slots,
    pub last_tool: Option<ToolName>,
    pub last_result: Option<serde_json::Value>,
    pub error: Option<ErrorState>,
    pub outlets_context: OutletsContext,
    /// 上一轮的动作日志（只读快照）
    pub last_actions: Vec<ToolAction>,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// 清空为新会话状态（保留 session_id）
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.session_id));
    }

    /// 历史中最近一次问答（最后一条用户消息之前）对应的门店结果
    pub fn prior_outlets(&self) -> Option<&OutletsSnapshot> {
        let latest = self.messages.iter().rposition(|m| m.role == Role::User)?;
        let reply_at = self.messages[..latest]
            .iter()
            .rposition(|m| m.role == Role::Assistant)?;
        let question = self.messages[..reply_at]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)?;
        self.outlets_context
            .lookup(question.content.trim(), self.messages[reply_at].content.trim())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ActionStatus;

    #[test]
    fn test_reset_keeps_session_id() {
        let mut state = ConversationState::new("s1");
        state.intent = Some(Intent::Calculation);
        state.last_actions.push(ToolAction::decision(ActionStatus::Success, "x"));
        state.reset();
        assert_eq!(state.session_id, "s1");
        assert!(state.intent.is_none());
        assert!(state.last_actions.is_empty());
    }

    fn snapshot(question: &str, reply: &str) -> OutletsSnapshot {
        OutletsSnapshot {
            question: question.to_string(),
            reply: reply.to_string(),
            result: serde_json::json!({ "rows": [] }),
        }
    }

    #[test]
    fn test_prior_outlets_requires_matching_history() {
        let mut state = ConversationState::new("s1");
        state
            .outlets_context
            .remember(snapshot("Any outlets in KL?", "ZUS Coffee KLCC is available."));

        state.messages = vec![Message::user("Any outlets in KL?")];
        assert!(state.prior_outlets().is_none());

        state.messages = vec![
            Message::user("Any outlets in KL?"),
            Message::assistant("ZUS Coffee KLCC is available."),
            Message::user("When does it close?"),
        ];
        assert_eq!(state.prior_outlets().unwrap().question, "Any outlets in KL?");

        state.messages[1] = Message::assistant("Something else.");
        assert!(state.prior_outlets().is_none());
    }

    #[test]
    fn test_outlets_snapshots_are_bounded_and_deduplicated() {
        let mut ctx = OutletsContext::default();
        ctx.remember(snapshot("q", "r"));
        ctx.remember(snapshot("q", "r"));
        assert_eq!(ctx.snapshots.len(), 1);
        for i in 0..(MAX_OUTLETS_SNAPSHOTS + 4) {
            ctx.remember(snapshot(&format!("q{i}"), "r"));
        }
        assert_eq!(ctx.snapshots.len(), MAX_OUTLETS_SNAPSHOTS);
        assert!(ctx.lookup("q0", "r").is_none());
        assert!(ctx.lookup("q19", "r").is_some());
    }

    #[test]
    fn test_memory_json_is_camel_case() {
        let state = ConversationState::new("abc");
        let v = state.to_json();
        assert_eq!(v["sessionId"], "abc");
        assert!(v.get("lastActions").is_some());
    }
}
