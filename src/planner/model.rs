//! 规划器的模型调用
//!
//! 每次调用先占用一个预算单位，再在截止时间内调用 LlmClient 并解析结构化输出；
//! 无论成功、失败还是因预算跳过，都发布一条 llm_call 事件
//! `{promptId, status, callsUsed, maxCalls, remainingCalls, latencyMs}`。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::core::budget::{BudgetVerdict, CallBudget};
use crate::core::event_stream::{send_event, SessionEmitter};
use crate::llm::{LlmClient, LlmError};
use crate::planner::intent::{
    parse_structured, DecisionResult, FollowUpResult, IntentResult, SynthesisResult,
};
use crate::planner::prompts::RenderedPrompt;
use crate::planner::{EventStatus, EventType, PlannerEvent, Slots};

/// 可由模型产出的结构化结果
pub trait ModelOutput: DeserializeOwned {
    /// 成功时附加到 llm_call 事件的字段
    fn event_extra(&self) -> Option<(&'static str, Value)> {
        None
    }

    /// 语义校验（JSON 合法但内容不可用时拒绝）
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl ModelOutput for IntentResult {
    fn event_extra(&self) -> Option<(&'static str, Value)> {
        Some(("intent", json!(self.intent.as_str())))
    }
}

impl ModelOutput for Slots {
    fn event_extra(&self) -> Option<(&'static str, Value)> {
        Some(("slots", json!(self)))
    }
}

impl ModelOutput for DecisionResult {
    fn event_extra(&self) -> Option<(&'static str, Value)> {
        Some(("decision", json!(self.decision.as_str())))
    }
}

impl ModelOutput for FollowUpResult {
    fn event_extra(&self) -> Option<(&'static str, Value)> {
        Some(("question", json!(self.question.trim())))
    }

    fn validate(&self) -> Result<(), String> {
        if self.question.trim().is_empty() {
            return Err("empty_follow_up".to_string());
        }
        Ok(())
    }
}

impl ModelOutput for SynthesisResult {
    fn validate(&self) -> Result<(), String> {
        if self.message.trim().is_empty() {
            return Err("empty_message".to_string());
        }
        Ok(())
    }
}

/// 一次模型调用的结果
#[derive(Debug)]
pub enum ModelOutcome<T> {
    Ok(T),
    /// 预算已用尽，未发起调用
    Skipped,
    Failed(LlmError),
}

pub struct PlannerModel {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl PlannerModel {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub fn backend(&self) -> &str {
        self.llm.name()
    }

    pub async fn invoke<T: ModelOutput>(
        &self,
        node: &str,
        prompt: &RenderedPrompt,
        budget: &mut CallBudget,
        events: Option<&SessionEmitter>,
    ) -> ModelOutcome<T> {
        if budget.consume() == BudgetVerdict::Exceeded {
            emit_llm_call(
                events,
                node,
                prompt.id,
                "skipped",
                budget,
                None,
                Some(("reason", json!("budget_exhausted"))),
            );
            return ModelOutcome::Skipped;
        }

        let start = Instant::now();
        let result = self.call::<T>(prompt).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                tracing::debug!(node, prompt_id = prompt.id, latency_ms, "llm call ok");
                let extra = output.event_extra();
                emit_llm_call(events, node, prompt.id, "success", budget, Some(latency_ms), extra);
                ModelOutcome::Ok(output)
            }
            Err(err) => {
                tracing::warn!(node, prompt_id = prompt.id, error = %err, "llm call failed");
                emit_llm_call(
                    events,
                    node,
                    prompt.id,
                    "error",
                    budget,
                    Some(latency_ms),
                    Some(("error", json!(err.to_string()))),
                );
                ModelOutcome::Failed(err)
            }
        }
    }

    async fn call<T: ModelOutput>(&self, prompt: &RenderedPrompt) -> Result<T, LlmError> {
        let raw = match tokio::time::timeout(self.timeout, self.llm.complete(&prompt.messages)).await {
            Ok(r) => r?,
            Err(_) => return Err(LlmError::Timeout(self.timeout.as_millis() as u64)),
        };
        let parsed: T = parse_structured(&raw).map_err(LlmError::InvalidResponse)?;
        parsed.validate().map_err(LlmError::InvalidResponse)?;
        Ok(parsed)
    }
}

fn emit_llm_call(
    events: Option<&SessionEmitter>,
    node: &str,
    prompt_id: &str,
    status: &str,
    budget: &CallBudget,
    latency_ms: Option<f64>,
    extra: Option<(&'static str, Value)>,
) {
    if events.is_none() {
        return;
    }
    let mut data = json!({
        "promptId": prompt_id,
        "status": status,
        "callsUsed": budget.used(),
        "maxCalls": budget.max(),
        "remainingCalls": budget.remaining(),
    });
    if let Some(ms) = latency_ms {
        data["latencyMs"] = json!((ms * 100.0).round() / 100.0);
    }
    if let Some((key, value)) = extra {
        data[key] = value;
    }
    let event_status = match status {
        "success" => EventStatus::Success,
        "error" => EventStatus::Error,
        _ => EventStatus::Pending,
    };
    send_event(
        events,
        PlannerEvent::new(EventType::LlmCall)
            .with_node(node)
            .with_status(event_status)
            .with_data(data),
    );
}
