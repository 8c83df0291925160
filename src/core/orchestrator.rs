//! 对话服务：一轮请求的入口
//!
//! 校验请求 -> 取得会话串行槽（queue 等待 / reject 返回 SessionBusy）-> 写入客户端提交的完整历史 ->
//! 运行状态机（事件同步推送到会话事件流）-> 返回回复、动作日志与会话记忆。

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::TurnPolicy;
use crate::core::event_stream::SessionEventStream;
use crate::core::session::SessionRegistry;
use crate::core::PlannerError;
use crate::memory::{Message, Role};
use crate::planner::{PlannerEvent, PlannerStateMachine, Terminal};
use crate::tools::ToolAction;

/// 一轮请求：客户端每次提交完整对话历史，最后一条必须是用户消息
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub session_id: String,
    pub messages: Vec<Message>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
        }
    }

    pub fn validate(&self) -> Result<(), PlannerError> {
        if self.session_id.trim().is_empty() {
            return Err(PlannerError::InvalidRequest("sessionId is required".to_string()));
        }
        let Some(last) = self.messages.last() else {
            return Err(PlannerError::InvalidRequest("messages must not be empty".to_string()));
        };
        if last.role != Role::User {
            return Err(PlannerError::InvalidRequest(
                "the last message must come from the user".to_string(),
            ));
        }
        if self.messages.iter().any(|m| m.role == Role::System) {
            return Err(PlannerError::InvalidRequest(
                "system messages are not accepted".to_string(),
            ));
        }
        if self.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err(PlannerError::InvalidRequest(
                "message content must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// 一轮的结果（返回后不再修改）
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: Message,
    pub actions: Vec<ToolAction>,
    pub memory: serde_json::Value,
    #[serde(skip)]
    pub terminal: Terminal,
    #[serde(skip)]
    pub calls_used: usize,
}

pub struct ChatService {
    machine: PlannerStateMachine,
    events: Arc<SessionEventStream>,
    turn_policy: TurnPolicy,
}

impl ChatService {
    pub fn new(
        machine: PlannerStateMachine,
        events: Arc<SessionEventStream>,
        turn_policy: TurnPolicy,
    ) -> Self {
        Self {
            machine,
            events,
            turn_policy,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.events.registry()
    }

    pub fn events(&self) -> &Arc<SessionEventStream> {
        &self.events
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnOutcome, PlannerError> {
        request.validate()?;
        let TurnRequest {
            session_id,
            messages,
        } = request;

        let slot = self.registry().get_or_create(&session_id);
        let mut state = match self.turn_policy {
            TurnPolicy::Queue => slot.lock().await,
            TurnPolicy::Reject => slot.try_lock().map_err(|_| {
                tracing::info!(session_id = %session_id, "turn rejected, session busy");
                PlannerError::SessionBusy(session_id.clone())
            })?,
        };
        tracing::info!(
            session_id = %session_id,
            messages = messages.len(),
            "turn started"
        );

        state.messages = messages;
        let emitter = self.events.emitter(&session_id);
        let result = self.machine.run_turn(&mut state, Some(&emitter)).await;
        self.registry().touch(&session_id);

        Ok(TurnOutcome {
            response: Message::assistant(result.response),
            actions: result.actions,
            memory: state.to_json(),
            terminal: result.terminal,
            calls_used: result.calls_used,
        })
    }

    /// 清空会话记忆与动作日志；进行中的轮次结束后才生效
    pub async fn reset_session(&self, session_id: &str) -> bool {
        self.registry().reset(session_id).await
    }

    pub fn subscribe(&self, session_id: &str) -> BoxStream<'static, PlannerEvent> {
        self.events.subscribe(session_id)
    }

    /// 启动空闲会话回收任务
    pub fn spawn_maintenance(
        &self,
        sweep_interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        self.registry().spawn_eviction_loop(sweep_interval, token)
    }
}
