//! 规划状态机
//!
//! ClassifyIntent -> ExtractSlots -> DecideAction -> { ToolCall -> DecideAction | AskFollowUp | Synthesize }
//!
//! 单轮内以显式 Node 枚举循环推进（不递归），节点访问次数有上限；AskFollowUp 与 Synthesize 为终态。
//! 每次模型调用与工具调用都占用 CallBudget；预算用尽时本轮只发布一条 budget_exceeded 错误事件，
//! 并以说明"结果不完整"的兜底回复结束。规划阶段的模型失败转为一次道歉式的 Synthesize。

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::core::budget::{BudgetVerdict, CallBudget};
use crate::core::event_stream::{send_event, SessionEmitter};
use crate::llm::LlmError;
use crate::memory::{format_conversation, ConversationState, ErrorState, Message, OutletsSnapshot};
use crate::planner::intent::{DecisionResult, FollowUpResult, IntentResult, SynthesisResult};
use crate::planner::model::{ModelOutcome, PlannerModel};
use crate::planner::prompts::{
    PromptTemplate, RenderedPrompt, DECISION_PROMPT, FOLLOW_UP_PROMPT, INTENT_PROMPT, SLOT_PROMPT, SYNTHESIS_PROMPT,
};
use crate::planner::slots::{
    build_outlets_query, is_product_aggregation_query, missing_slots, needs_product_clarification,
};
use crate::planner::synthesis::{
    apology_message, budget_exhausted_message, build_tool_summary, fallback_follow_up,
    rule_based_message, small_talk_message, successful_messages,
};
use crate::planner::{Decision, EventStatus, EventType, Intent, PlannerEvent, Slots};
use crate::tools::{ActionStatus, ToolAction, ToolDispatcher, ToolName};

/// 单轮节点访问上限（工具循环另受预算约束）
const MAX_NODE_VISITS: usize = 16;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub max_calls_per_turn: usize,
    /// 拼进提示词的最近消息条数
    pub history_window: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_calls_per_turn: 6,
            history_window: 6,
        }
    }
}

/// 本轮以哪个终态结束
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    AskFollowUp,
    Synthesize,
}

impl Terminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Terminal::AskFollowUp => "ask_follow_up",
            Terminal::Synthesize => "synthesize",
        }
    }
}

/// 一轮的结果
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub response: String,
    pub actions: Vec<ToolAction>,
    pub terminal: Terminal,
    pub calls_used: usize,
}

#[derive(Debug)]
enum SynthesisMode {
    Model,
    BudgetExhausted,
    ModelFailure(LlmError),
}

#[derive(Debug)]
enum Node {
    ClassifyIntent,
    ExtractSlots,
    DecideAction,
    ToolCall { tool: ToolName, args: Value },
    AskFollowUp { missing: Vec<&'static str> },
    Synthesize(SynthesisMode),
}

/// 单轮运行时上下文
struct Turn<'a> {
    state: &'a mut ConversationState,
    events: Option<&'a SessionEmitter>,
    budget: CallBudget,
    actions: Vec<ToolAction>,
    intent: Intent,
    /// 本轮已执行的 (工具, 参数)，用于拦截重复调用
    executed: Vec<(ToolName, Value)>,
    /// 门店查询文本只在本轮首次使用时构造，保证重复调用可被识别
    outlets_query: Option<String>,
    aggregation: bool,
    budget_reported: bool,
    /// 本轮最后一次成功的门店查询（问题，结果），回复确定后记入会话快照
    pending_outlets: Option<(String, Value)>,
}

impl Turn<'_> {
    fn emit(&self, event: PlannerEvent) {
        send_event(self.events, event);
    }

    fn node_start(&self, node: &str, data: Option<Value>) {
        let mut event = PlannerEvent::new(EventType::NodeStart)
            .with_node(node)
            .with_status(EventStatus::Pending);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.emit(event);
    }

    fn node_end(&self, node: &str, status: EventStatus, data: Option<Value>) {
        let mut event = PlannerEvent::new(EventType::NodeEnd)
            .with_node(node)
            .with_status(status);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.emit(event);
    }

    fn decision_event(&self, node: &str, data: Value) {
        self.emit(
            PlannerEvent::new(EventType::Decision)
                .with_node(node)
                .with_status(EventStatus::Success)
                .with_data(data),
        );
    }

    /// 本轮只报告一次预算耗尽
    fn report_budget_exceeded(&mut self, node: &str) {
        if self.budget_reported {
            return;
        }
        self.budget_reported = true;
        tracing::warn!(
            session_id = %self.state.session_id,
            node,
            calls_used = self.budget.used(),
            max_calls = self.budget.max(),
            "call budget exhausted"
        );
        self.emit(
            PlannerEvent::new(EventType::Error)
                .with_node(node)
                .with_status(EventStatus::Error)
                .with_message("Call budget exhausted for this turn.")
                .with_data(json!({
                    "errorType": "budget_exceeded",
                    "callsUsed": self.budget.used(),
                    "maxCalls": self.budget.max(),
                })),
        );
    }

    fn report_model_failure(&mut self, node: &str, err: &LlmError) {
        self.state.error = Some(ErrorState {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        self.emit(
            PlannerEvent::new(EventType::Error)
                .with_node(node)
                .with_status(EventStatus::Error)
                .with_message("The planner model call failed.")
                .with_data(json!({ "errorType": err.kind(), "detail": err.to_string() })),
        );
    }

    fn latest_user_message(&self) -> String {
        self.state
            .messages
            .last()
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default()
    }

    fn slots_json(&self) -> String {
        serde_json::to_string(&self.state.slots).unwrap_or_else(|_| "{}".to_string())
    }

    fn record_decision(&mut self, decision: Decision, message: impl Into<String>) {
        self.actions.push(
            ToolAction::decision(ActionStatus::Success, message)
                .with_data(json!({ "decision": decision.as_str() })),
        );
    }
}

pub struct PlannerStateMachine {
    model: PlannerModel,
    dispatcher: Arc<ToolDispatcher>,
    config: PlannerConfig,
}

impl PlannerStateMachine {
    pub fn new(model: PlannerModel, dispatcher: Arc<ToolDispatcher>, config: PlannerConfig) -> Self {
        Self {
            model,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// 运行一轮：state.messages 末尾是本轮的用户消息；结束时追加助手回复并记录动作日志
    pub async fn run_turn(
        &self,
        state: &mut ConversationState,
        events: Option<&SessionEmitter>,
    ) -> TurnResult {
        state.error = None;
        state.intent = None;
        state.slots = Slots::default();
        let mut turn = Turn {
            state,
            events,
            budget: CallBudget::new(self.config.max_calls_per_turn),
            actions: Vec::new(),
            intent: Intent::Ambiguous,
            executed: Vec::new(),
            outlets_query: None,
            aggregation: false,
            budget_reported: false,
            pending_outlets: None,
        };
        turn.emit(
            PlannerEvent::new(EventType::PlannerState)
                .with_status(EventStatus::Pending)
                .with_data(json!({
                    "sessionId": turn.state.session_id,
                    "status": "started",
                    "maxCalls": turn.budget.max(),
                    "messageCount": turn.state.messages.len(),
                })),
        );

        let mut node = Node::ClassifyIntent;
        let mut visits = 0;
        let (response, terminal) = loop {
            visits += 1;
            if visits > MAX_NODE_VISITS
                && !matches!(node, Node::Synthesize(_) | Node::AskFollowUp { .. })
            {
                tracing::warn!(session_id = %turn.state.session_id, "planner node ceiling reached");
                node = Node::Synthesize(SynthesisMode::Model);
            }
            tracing::debug!(session_id = %turn.state.session_id, ?node, "planner node");
            node = match node {
                Node::ClassifyIntent => self.classify_intent(&mut turn).await,
                Node::ExtractSlots => self.extract_slots(&mut turn).await,
                Node::DecideAction => self.decide_action(&mut turn).await,
                Node::ToolCall { tool, args } => self.call_tool(&mut turn, tool, args).await,
                Node::AskFollowUp { missing } => {
                    break (self.ask_follow_up(&mut turn, &missing).await, Terminal::AskFollowUp);
                }
                Node::Synthesize(mode) => {
                    break (self.synthesize(&mut turn, mode).await, Terminal::Synthesize);
                }
            };
        };

        let calls_used = turn.budget.used();
        let actions = std::mem::take(&mut turn.actions);
        turn.emit(
            PlannerEvent::new(EventType::Message)
                .with_node(terminal.as_str())
                .with_status(EventStatus::Success)
                .with_message(response.clone())
                .with_data(json!({ "role": "assistant", "content": response })),
        );
        turn.emit(
            PlannerEvent::new(EventType::PlannerState)
                .with_status(EventStatus::Success)
                .with_data(json!({
                    "sessionId": turn.state.session_id,
                    "status": "completed",
                    "terminal": terminal.as_str(),
                    "intent": turn.intent.as_str(),
                    "callsUsed": calls_used,
                    "maxCalls": turn.budget.max(),
                    "actionCount": actions.len(),
                })),
        );
        tracing::info!(
            session_id = %turn.state.session_id,
            intent = turn.intent.as_str(),
            terminal = terminal.as_str(),
            calls_used,
            actions = actions.len(),
            "turn completed"
        );

        if let Some((question, result)) = turn.pending_outlets.take() {
            turn.state.outlets_context.remember(OutletsSnapshot {
                question,
                reply: response.trim().to_string(),
                result,
            });
        }
        turn.state.messages.push(Message::assistant(response.clone()));
        turn.state.last_actions = actions.clone();
        TurnResult {
            response,
            actions,
            terminal,
            calls_used,
        }
    }

    fn render(&self, turn: &Turn<'_>, template: PromptTemplate, extra: &[(&str, &str)]) -> RenderedPrompt {
        let messages = &turn.state.messages;
        let history = &messages[..messages.len().saturating_sub(1)];
        let conversation = format_conversation(history, self.config.history_window);
        let latest = turn.latest_user_message();
        let intent = turn.intent.as_str();
        let slots_json = turn.slots_json();
        let mut vars: Vec<(&str, &str)> = vec![
            ("conversation", conversation.as_str()),
            ("user_message", latest.as_str()),
            ("intent", intent),
            ("slots_json", slots_json.as_str()),
        ];
        vars.extend_from_slice(extra);
        template.render(&vars)
    }

    async fn classify_intent(&self, turn: &mut Turn<'_>) -> Node {
        const NODE: &str = "classify_intent";
        turn.node_start(NODE, None);
        let prompt = self.render(turn, INTENT_PROMPT, &[]);
        match self
            .model
            .invoke::<IntentResult>(NODE, &prompt, &mut turn.budget, turn.events)
            .await
        {
            ModelOutcome::Ok(result) => {
                turn.intent = result.intent;
                turn.state.intent = Some(result.intent);
                turn.decision_event(NODE, json!({ "intent": result.intent.as_str() }));
                turn.node_end(NODE, EventStatus::Success, Some(json!({ "intent": result.intent.as_str() })));
                Node::ExtractSlots
            }
            ModelOutcome::Skipped => {
                turn.report_budget_exceeded(NODE);
                turn.node_end(NODE, EventStatus::Error, None);
                Node::Synthesize(SynthesisMode::BudgetExhausted)
            }
            ModelOutcome::Failed(err) => {
                turn.report_model_failure(NODE, &err);
                turn.node_end(NODE, EventStatus::Error, None);
                Node::Synthesize(SynthesisMode::ModelFailure(err))
            }
        }
    }

    async fn extract_slots(&self, turn: &mut Turn<'_>) -> Node {
        const NODE: &str = "extract_slots";
        turn.node_start(NODE, None);
        if turn.intent.tool().is_some() {
            let prompt = self.render(turn, SLOT_PROMPT, &[]);
            match self
                .model
                .invoke::<Slots>(NODE, &prompt, &mut turn.budget, turn.events)
                .await
            {
                ModelOutcome::Ok(slots) => turn.state.slots = slots.normalized(),
                ModelOutcome::Skipped => {
                    turn.report_budget_exceeded(NODE);
                    turn.node_end(NODE, EventStatus::Error, None);
                    return Node::Synthesize(SynthesisMode::BudgetExhausted);
                }
                ModelOutcome::Failed(err) => {
                    turn.report_model_failure(NODE, &err);
                    turn.node_end(NODE, EventStatus::Error, None);
                    return Node::Synthesize(SynthesisMode::ModelFailure(err));
                }
            }
        }

        let missing = missing_slots(turn.intent, &turn.state.slots, &*turn.state);
        turn.node_end(
            NODE,
            EventStatus::Success,
            Some(json!({ "slots": turn.state.slots, "missing": missing })),
        );
        if missing.is_empty() {
            Node::DecideAction
        } else {
            Node::AskFollowUp { missing }
        }
    }

    async fn decide_action(&self, turn: &mut Turn<'_>) -> Node {
        const NODE: &str = "decide_action";
        turn.node_start(NODE, None);

        let decision = match turn.intent {
            Intent::SmallTalk => Decision::RespondSmalltalk,
            Intent::Ambiguous => Decision::AskFollowUp,
            _ => {
                let summary = build_tool_summary(&turn.actions, turn.aggregation);
                let prompt = self.render(
                    turn,
                    DECISION_PROMPT,
                    &[("missing", "none"), ("tool_summary", summary.as_str())],
                );
                match self
                    .model
                    .invoke::<DecisionResult>(NODE, &prompt, &mut turn.budget, turn.events)
                    .await
                {
                    ModelOutcome::Ok(result) => result.decision,
                    ModelOutcome::Skipped => {
                        turn.report_budget_exceeded(NODE);
                        turn.node_end(NODE, EventStatus::Error, None);
                        return Node::Synthesize(SynthesisMode::BudgetExhausted);
                    }
                    ModelOutcome::Failed(err) => {
                        turn.report_model_failure(NODE, &err);
                        turn.node_end(NODE, EventStatus::Error, None);
                        return Node::Synthesize(SynthesisMode::ModelFailure(err));
                    }
                }
            }
        };

        let (effective, next) = self.resolve_decision(turn, decision);
        turn.decision_event(NODE, json!({ "decision": effective.as_str() }));
        turn.node_end(NODE, EventStatus::Success, Some(json!({ "decision": effective.as_str() })));
        next
    }

    /// 把模型决策落到下一个节点；笼统的产品查询、缺参数与重复调用在这里被改写
    fn resolve_decision(&self, turn: &mut Turn<'_>, decision: Decision) -> (Decision, Node) {
        match decision {
            Decision::RespondSmalltalk => {
                turn.record_decision(decision, "Responded with small-talk guidance.");
                (decision, Node::Synthesize(SynthesisMode::Model))
            }
            Decision::Respond => {
                turn.record_decision(decision, "Answering with the tool results gathered so far.");
                (decision, Node::Synthesize(SynthesisMode::Model))
            }
            Decision::AskFollowUp => {
                let missing = missing_slots(turn.intent, &turn.state.slots, &*turn.state);
                (decision, Node::AskFollowUp { missing })
            }
            Decision::CallCalc | Decision::CallProducts | Decision::CallOutlets => {
                let Some(tool) = decision.tool() else {
                    return (Decision::AskFollowUp, Node::AskFollowUp { missing: Vec::new() });
                };
                if tool == ToolName::Products
                    && needs_product_clarification(turn.state.slots.product_query.as_deref())
                {
                    return (Decision::AskFollowUp, Node::AskFollowUp { missing: vec!["productQuery"] });
                }
                let Some(args) = tool_args(turn, tool) else {
                    return (Decision::AskFollowUp, Node::AskFollowUp { missing: required_slots(tool) });
                };
                if turn.executed.iter().any(|(t, a)| *t == tool && *a == args) {
                    turn.record_decision(
                        Decision::Respond,
                        format!("Skipped a repeated {tool} call; answering with existing results."),
                    );
                    return (Decision::Respond, Node::Synthesize(SynthesisMode::Model));
                }
                if tool == ToolName::Products {
                    turn.aggregation = is_product_aggregation_query(&turn.latest_user_message());
                }
                turn.record_decision(decision, format!("Calling the {tool} tool."));
                (decision, Node::ToolCall { tool, args })
            }
        }
    }

    async fn call_tool(&self, turn: &mut Turn<'_>, tool: ToolName, args: Value) -> Node {
        let node = format!("call_{tool}");
        turn.node_start(&node, Some(json!({ "tool": tool, "args": args })));
        if turn.budget.consume() == BudgetVerdict::Exceeded {
            turn.report_budget_exceeded(&node);
            turn.node_end(&node, EventStatus::Error, None);
            return Node::Synthesize(SynthesisMode::BudgetExhausted);
        }

        turn.actions.push(ToolAction::tool_call(tool, args.clone()));
        let action = self.dispatcher.execute(tool, args.clone(), turn.events).await;
        record_tool_result(turn, tool, &args, &action);
        let status = if action.is_success() {
            EventStatus::Success
        } else {
            EventStatus::Error
        };
        turn.actions.push(action);
        turn.executed.push((tool, args));
        turn.node_end(&node, status, None);
        Node::DecideAction
    }

    async fn ask_follow_up(&self, turn: &mut Turn<'_>, missing: &[&'static str]) -> String {
        const NODE: &str = "ask_follow_up";
        turn.node_start(NODE, Some(json!({ "missing": missing })));
        let missing_text = if missing.is_empty() {
            "none".to_string()
        } else {
            missing.join(", ")
        };
        let prompt = self.render(turn, FOLLOW_UP_PROMPT, &[("missing", missing_text.as_str())]);
        let question = match self
            .model
            .invoke::<FollowUpResult>(NODE, &prompt, &mut turn.budget, turn.events)
            .await
        {
            ModelOutcome::Ok(result) => result.question.trim().to_string(),
            ModelOutcome::Skipped => {
                turn.report_budget_exceeded(NODE);
                fallback_follow_up(turn.intent).to_string()
            }
            ModelOutcome::Failed(_) => fallback_follow_up(turn.intent).to_string(),
        };

        turn.actions.push(
            ToolAction::decision(ActionStatus::Success, question.clone())
                .with_data(json!({ "decision": Decision::AskFollowUp.as_str(), "missing": missing })),
        );
        turn.node_end(NODE, EventStatus::Success, Some(json!({ "question": question })));
        question
    }

    async fn synthesize(&self, turn: &mut Turn<'_>, mode: SynthesisMode) -> String {
        const NODE: &str = "synthesize";
        turn.node_start(NODE, None);
        let response = match mode {
            SynthesisMode::BudgetExhausted => budget_exhausted_message(&turn.actions),
            SynthesisMode::ModelFailure(err) => apology_message(&err),
            SynthesisMode::Model => {
                let summary = build_tool_summary(&turn.actions, turn.aggregation);
                let prompt = self.render(turn, SYNTHESIS_PROMPT, &[("tool_summary", summary.as_str())]);
                match self
                    .model
                    .invoke::<SynthesisResult>(NODE, &prompt, &mut turn.budget, turn.events)
                    .await
                {
                    ModelOutcome::Ok(result) => {
                        let message = result.message.trim().to_string();
                        match result.follow_up.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                            Some(follow_up) => format!("{message}\n\n{follow_up}"),
                            None => message,
                        }
                    }
                    ModelOutcome::Skipped => {
                        turn.report_budget_exceeded(NODE);
                        budget_exhausted_message(&turn.actions)
                    }
                    ModelOutcome::Failed(_) => {
                        if turn.intent == Intent::SmallTalk && successful_messages(&turn.actions).is_empty() {
                            small_talk_message().to_string()
                        } else {
                            rule_based_message(&turn.actions)
                        }
                    }
                }
            }
        };
        turn.node_end(NODE, EventStatus::Success, Some(json!({ "response": response })));
        response
    }
}

fn required_slots(tool: ToolName) -> Vec<&'static str> {
    match tool {
        ToolName::Calc => vec!["calcExpression"],
        ToolName::Products => vec!["productQuery"],
        ToolName::Outlets => vec!["outletArea", "outletName"],
    }
}

/// 由槽位构造工具参数；缺少必需值时返回 None
fn tool_args(turn: &mut Turn<'_>, tool: ToolName) -> Option<Value> {
    match tool {
        ToolName::Calc => turn
            .state
            .slots
            .calc_expression
            .as_ref()
            .map(|e| json!({ "expression": e })),
        ToolName::Products => turn
            .state
            .slots
            .product_query
            .as_ref()
            .map(|q| json!({ "query": q })),
        ToolName::Outlets => {
            if turn.outlets_query.is_none() {
                turn.outlets_query = Some(build_outlets_query(&*turn.state));
            }
            turn.outlets_query
                .as_deref()
                .filter(|q| !q.is_empty())
                .map(|q| json!({ "query": q }))
        }
    }
}

/// 把工具结果写回会话状态（上一次工具与结果、错误、门店追问上下文）
fn record_tool_result(turn: &mut Turn<'_>, tool: ToolName, args: &Value, action: &ToolAction) {
    let latest = turn.latest_user_message();
    let state = &mut *turn.state;
    state.last_tool = Some(tool);
    if action.is_success() {
        state.last_result = action.data.clone();
        state.error = None;
        if tool == ToolName::Outlets {
            state.outlets_context.last_raw_question = Some(latest.clone());
            state.outlets_context.last_enriched_query =
                args.get("query").and_then(Value::as_str).map(str::to_string);
            if let Some(data) = &action.data {
                turn.pending_outlets = Some((latest, data.clone()));
            }
        }
    } else {
        state.last_result = None;
        let kind = action
            .data
            .as_ref()
            .and_then(|d| d.get("errorType"))
            .and_then(Value::as_str)
            .unwrap_or("tool_error");
        state.error = Some(ErrorState {
            kind: kind.to_string(),
            message: action.message.clone().unwrap_or_default(),
        });
    }
}
