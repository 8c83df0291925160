//! 离线 LLM 客户端（无需 API）
//!
//! - HeuristicLlmClient：按 prompt_id 识别任务，用关键词规则给出确定性的结构化 JSON，本地即可跑通完整规划流程
//! - ScriptedLlmClient：按顺序返回预置输出，用于测试模型失败、超时与异常输出

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::planner::prompts::{
    detect_prompt_id, section, LABEL_INTENT, LABEL_MISSING, LABEL_QUESTION, LABEL_SLOTS,
    LABEL_TOOL_RESULTS, LABEL_USER_MESSAGE,
};
use crate::planner::{Intent, Slots};
use crate::tools::text2sql::{match_outlet_area, OUTLET_COLUMNS};
use crate::tools::ToolName;

const CALC_WORDS: &[&str] = &["calculate", "compute", "/calc", "plus", "minus", "times", "divided", "sqrt"];
const PRODUCT_WORDS: &[&str] = &[
    "tumbler", "mug", "cup", "bottle", "drinkware", "flask", "product", "merch", "glass", "straw",
];
const OUTLET_WORDS: &[&str] = &[
    "outlet", "store", "branch", "open", "opening", "close", "closing", "hours", "location", "address",
];
const SMALL_TALK_WORDS: &[&str] = &["hi", "hello", "hey", "thanks", "thank", "morning", "bye"];

/// 确定性的启发式后端
#[derive(Debug, Default)]
pub struct HeuristicLlmClient;

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '/'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_any(words: &[String], list: &[&str]) -> bool {
    words
        .iter()
        .any(|w| list.iter().any(|k| w == k || (k.len() > 3 && w.starts_with(k))))
}

/// 取消息中最长的算式片段（需含数字与运算符）
fn find_expression(text: &str) -> Option<String> {
    let body = text.trim().trim_start_matches("/calc");
    let mut best = String::new();
    let mut current = String::new();
    for c in body.chars() {
        if c.is_ascii_digit() || "+-*/^%()., ".contains(c) {
            current.push(c);
        } else {
            if current.trim().len() > best.trim().len() {
                best = current.clone();
            }
            current.clear();
        }
    }
    if current.trim().len() > best.trim().len() {
        best = current;
    }
    let best = best.trim().trim_end_matches(['.', ',']).trim().to_string();
    let has_digit = best.chars().any(|c| c.is_ascii_digit());
    let has_op = best.chars().any(|c| "+-*/^%".contains(c));
    (has_digit && has_op).then_some(best)
}

fn classify(message: &str) -> Intent {
    let w = words(message);
    if message.trim_start().starts_with("/calc") || has_any(&w, CALC_WORDS) || find_expression(message).is_some() {
        return Intent::Calculation;
    }
    if has_any(&w, OUTLET_WORDS) || match_outlet_area(message).is_some() {
        return Intent::OutletQuery;
    }
    if has_any(&w, PRODUCT_WORDS) {
        return Intent::ProductQuery;
    }
    if has_any(&w, SMALL_TALK_WORDS) {
        return Intent::SmallTalk;
    }
    Intent::Ambiguous
}

fn parse_intent(label: Option<&str>) -> Intent {
    label
        .and_then(|s| serde_json::from_value(serde_json::Value::String(s.trim().to_string())).ok())
        .unwrap_or(Intent::Ambiguous)
}

fn extract_slots(intent: Intent, message: &str) -> Slots {
    let mut slots = Slots::default();
    match intent {
        Intent::Calculation => slots.calc_expression = find_expression(message),
        Intent::ProductQuery => {
            if has_any(&words(message), PRODUCT_WORDS) {
                slots.product_query = Some(message.trim().trim_end_matches('?').trim().to_string());
            }
        }
        Intent::OutletQuery => {
            slots.outlet_area = match_outlet_area(message).map(|(alias, _)| alias.to_string());
        }
        Intent::SmallTalk | Intent::Ambiguous => {}
    }
    slots
}

fn has_tool_results(text: &str) -> bool {
    section(text, LABEL_TOOL_RESULTS)
        .map(|s| !s.is_empty() && s != "none")
        .unwrap_or(false)
}

/// Missing 为 "none" 表示规划器已确认可以调用工具（例如门店追问可沿用上一次结果）
fn decide(intent: Intent, slots: &Slots, tool_results: bool, missing: Option<&str>) -> &'static str {
    if tool_results {
        return "respond";
    }
    if missing == Some("none") {
        match intent.tool() {
            Some(ToolName::Calc) => return "call_calc",
            Some(ToolName::Products) => return "call_products",
            Some(ToolName::Outlets) => return "call_outlets",
            None => {}
        }
    }
    match intent {
        Intent::Calculation if slots.calc_expression.is_some() => "call_calc",
        Intent::ProductQuery if slots.product_query.is_some() => "call_products",
        Intent::OutletQuery if slots.outlet_area.is_some() || slots.outlet_name.is_some() => "call_outlets",
        Intent::SmallTalk => "respond_smalltalk",
        _ => "ask_follow_up",
    }
}

fn follow_up_question(intent: Intent, missing: &str) -> String {
    match intent {
        Intent::Calculation => "Which expression should I calculate?".to_string(),
        Intent::ProductQuery => "Which drinkware item or style are you looking for?".to_string(),
        Intent::OutletQuery => "Which outlet or area should I check?".to_string(),
        _ if !missing.is_empty() => format!("Could you tell me the {missing}?"),
        _ => "Could you clarify what you need help with?".to_string(),
    }
}

/// 工具摘要行形如 `- [tool] status: message`，取出 message 拼接为回复
fn synthesize(intent: Intent, tool_summary: &str) -> String {
    let parts: Vec<&str> = tool_summary
        .lines()
        .filter(|line| line.trim_start().starts_with("- ["))
        .filter_map(|line| line.split_once(": ").map(|(_, msg)| msg.trim()))
        .filter(|msg| !msg.is_empty())
        .collect();
    if !parts.is_empty() {
        return parts.join(" ");
    }
    match intent {
        Intent::SmallTalk => {
            "Hi there! I can help with drinkware, outlet opening hours, or quick calculations.".to_string()
        }
        _ => "Could you clarify what you need help with?".to_string(),
    }
}

/// 产品上下文行形如 `- title | price | snippet`
fn summarize_products(question: &str, context: &str) -> String {
    let titles: Vec<&str> = context
        .lines()
        .filter_map(|l| l.trim().strip_prefix("- "))
        .map(|l| l.split(" | ").next().unwrap_or(l).trim())
        .filter(|t| !t.is_empty())
        .take(4)
        .collect();
    if titles.is_empty() {
        return format!("I couldn't find drinkware matching '{question}'.");
    }
    format!("Top matches for '{}' include: {}.", question, titles.join(", "))
}

/// 生成带字面量的 SQL，由调用方提升为命名参数
fn text_to_sql(question: &str, top_k: &str) -> String {
    let columns = OUTLET_COLUMNS.join(", ");
    let limit = top_k.trim().parse::<usize>().unwrap_or(10);
    match match_outlet_area(question) {
        Some((area, _)) => format!(
            "SELECT {columns} FROM outlets WHERE LOWER(name) LIKE '%{area}%' OR LOWER(city) LIKE '%{area}%' ORDER BY name LIMIT {limit}"
        ),
        None => format!("SELECT {columns} FROM outlets ORDER BY name LIMIT {limit}"),
    }
}

#[async_trait]
impl LlmClient for HeuristicLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let prompt_id = detect_prompt_id(messages)
            .ok_or_else(|| LlmError::Provider("missing prompt marker".to_string()))?;
        let user = messages.get(1).map(|m| m.content.as_str()).unwrap_or("");
        let latest = section(user, LABEL_USER_MESSAGE).unwrap_or("");
        let intent = parse_intent(section(user, LABEL_INTENT));
        let slots: Slots = section(user, LABEL_SLOTS)
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        let out = match prompt_id {
            "planner.intent.v1" => {
                let intent = classify(latest);
                json!({ "intent": intent.as_str(), "rationale": "keyword match" }).to_string()
            }
            "planner.slots.v1" => serde_json::to_string(&extract_slots(intent, latest))
                .map_err(|e| LlmError::InvalidResponse(e.to_string()))?,
            "planner.decision.v1" => {
                json!({ "decision": decide(intent, &slots, has_tool_results(user), section(user, LABEL_MISSING)) })
                    .to_string()
            }
            "planner.follow_up.v1" => {
                let missing = section(user, LABEL_MISSING).unwrap_or("");
                json!({ "question": follow_up_question(intent, missing) }).to_string()
            }
            "planner.synthesis.v1" => {
                let summary = section(user, LABEL_TOOL_RESULTS).unwrap_or("");
                json!({ "message": synthesize(intent, summary) }).to_string()
            }
            "products.summary.v1" => {
                let question = section(user, LABEL_QUESTION).unwrap_or("");
                let context = section(user, "Product context:").unwrap_or("");
                summarize_products(question, context)
            }
            "outlets.text2sql.v1" => {
                let question = section(user, LABEL_QUESTION).unwrap_or("");
                text_to_sql(question, section(user, "Limit:").unwrap_or("10"))
            }
            other => return Err(LlmError::Provider(format!("unsupported prompt: {other}"))),
        };
        Ok(out)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// 脚本化客户端：按顺序弹出预置结果；脚本耗尽时报错
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(outputs.into_iter().map(|s| Ok(s.into())).collect()),
            ..Default::default()
        }
    }

    pub fn push_ok(&self, output: impl Into<String>) {
        self.lock_script().push_back(Ok(output.into()));
    }

    pub fn push_err(&self, err: LlmError) {
        self.lock_script().push_back(Err(err));
    }

    /// 每次调用前等待（用于超时测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 已收到的 prompt_id 序列
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let id = detect_prompt_id(messages).unwrap_or("unknown").to_string();
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.lock_script().pop_front();
        next.unwrap_or_else(|| Err(LlmError::Provider("script exhausted".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::prompts::{DECISION_PROMPT, INTENT_PROMPT, SLOT_PROMPT, TEXT2SQL_PROMPT};

    #[test]
    fn test_classify_keywords() {
        assert_eq!(classify("/calc 5 + 10"), Intent::Calculation);
        assert_eq!(classify("what is 12 * 3?"), Intent::Calculation);
        assert_eq!(classify("Is there an outlet in Petaling Jaya?"), Intent::OutletQuery);
        assert_eq!(classify("SS 2, what's the opening time?"), Intent::OutletQuery);
        assert_eq!(classify("Do you sell tumblers?"), Intent::ProductQuery);
        assert_eq!(classify("hello!"), Intent::SmallTalk);
        assert_eq!(classify("what about the weather"), Intent::Ambiguous);
    }

    #[test]
    fn test_find_expression() {
        assert_eq!(find_expression("/calc 5 + 10").as_deref(), Some("5 + 10"));
        assert_eq!(find_expression("what is (2+3)*4?").as_deref(), Some("(2+3)*4"));
        assert_eq!(find_expression("I have 2 cups"), None);
    }

    #[tokio::test]
    async fn test_heuristic_intent_and_slots() {
        let llm = HeuristicLlmClient;
        let p = INTENT_PROMPT.render(&[("user_message", "/calc 5 + 10")]);
        let out = llm.complete(&p.messages).await.unwrap();
        assert!(out.contains("calculation"));

        let p = SLOT_PROMPT.render(&[("intent", "calculation"), ("user_message", "/calc 5 + 10")]);
        let out = llm.complete(&p.messages).await.unwrap();
        assert!(out.contains("\"calcExpression\":\"5 + 10\""));
    }

    #[tokio::test]
    async fn test_heuristic_decision_respects_tool_results() {
        let llm = HeuristicLlmClient;
        let p = DECISION_PROMPT.render(&[
            ("intent", "calculation"),
            ("slots_json", r#"{"calcExpression":"1+1"}"#),
            ("tool_summary", "none"),
        ]);
        assert!(llm.complete(&p.messages).await.unwrap().contains("call_calc"));

        let p = DECISION_PROMPT.render(&[
            ("intent", "calculation"),
            ("slots_json", r#"{"calcExpression":"1+1"}"#),
            ("tool_summary", "- [calc] success: The result for `1+1` is **2**."),
        ]);
        assert!(llm.complete(&p.messages).await.unwrap().contains("respond"));
    }

    #[tokio::test]
    async fn test_heuristic_text2sql_uses_literals() {
        let llm = HeuristicLlmClient;
        let p = TEXT2SQL_PROMPT.render(&[("question", "outlets in PJ"), ("top_k", "5"), ("schema", "")]);
        let sql = llm.complete(&p.messages).await.unwrap();
        assert!(sql.starts_with("SELECT "));
        assert!(sql.contains("'%petaling jaya%'"));
        assert!(sql.ends_with("LIMIT 5"));
    }

    #[tokio::test]
    async fn test_scripted_client_order_and_exhaustion() {
        let llm = ScriptedLlmClient::new(["first"]);
        llm.push_err(LlmError::Unavailable("down".into()));
        let p = INTENT_PROMPT.render(&[]);
        assert_eq!(llm.complete(&p.messages).await.unwrap(), "first");
        assert_eq!(
            llm.complete(&p.messages).await,
            Err(LlmError::Unavailable("down".into()))
        );
        assert!(llm.complete(&p.messages).await.is_err());
        assert_eq!(llm.calls().len(), 3);
        assert_eq!(llm.calls()[0], "planner.intent.v1");
    }
}
