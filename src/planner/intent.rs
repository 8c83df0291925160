//! 意图、槽位与决策，以及模型结构化输出的解析
//!
//! 模型输出 JSON（可能包在 ```json 代码块里或夹杂说明文字）；extract_json 取出 JSON 主体再反序列化。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tools::ToolName;

/// 封闭的意图集合；兼容模型常用的简写
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[serde(alias = "chitchat", alias = "smalltalk")]
    SmallTalk,
    #[serde(alias = "products", alias = "product")]
    ProductQuery,
    #[serde(alias = "outlets", alias = "outlet")]
    OutletQuery,
    #[serde(alias = "calc", alias = "calculator")]
    Calculation,
    #[serde(alias = "unknown")]
    Ambiguous,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::SmallTalk => "small_talk",
            Intent::ProductQuery => "product_query",
            Intent::OutletQuery => "outlet_query",
            Intent::Calculation => "calculation",
            Intent::Ambiguous => "ambiguous",
        }
    }

    /// 该意图对应的工具；闲聊与不明确意图没有工具
    pub fn tool(&self) -> Option<ToolName> {
        match self {
            Intent::Calculation => Some(ToolName::Calc),
            Intent::ProductQuery => Some(ToolName::Products),
            Intent::OutletQuery => Some(ToolName::Outlets),
            Intent::SmallTalk | Intent::Ambiguous => None,
        }
    }
}

/// DecideAction 的输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AskFollowUp,
    CallCalc,
    CallProducts,
    CallOutlets,
    #[serde(alias = "respond_small_talk")]
    RespondSmalltalk,
    /// 已有足够信息，直接合成回复
    #[serde(alias = "synthesize", alias = "answer")]
    Respond,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::AskFollowUp => "ask_follow_up",
            Decision::CallCalc => "call_calc",
            Decision::CallProducts => "call_products",
            Decision::CallOutlets => "call_outlets",
            Decision::RespondSmalltalk => "respond_smalltalk",
            Decision::Respond => "respond",
        }
    }

    pub fn tool(&self) -> Option<ToolName> {
        match self {
            Decision::CallCalc => Some(ToolName::Calc),
            Decision::CallProducts => Some(ToolName::Products),
            Decision::CallOutlets => Some(ToolName::Outlets),
            _ => None,
        }
    }
}

/// 槽位：各意图所需的结构化参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet_area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlet_name: Option<String>,
}

impl Slots {
    /// 去掉首尾空白，空串视为未提供
    pub fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            calc_expression: clean(self.calc_expression),
            product_query: clean(self.product_query),
            outlet_area: clean(self.outlet_area),
            outlet_name: clean(self.outlet_name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calc_expression.is_none()
            && self.product_query.is_none()
            && self.outlet_area.is_none()
            && self.outlet_name.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentResult {
    pub intent: Intent,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionResult {
    pub decision: Decision,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    pub message: String,
    #[serde(default)]
    pub follow_up: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpResult {
    pub question: String,
}

/// 从模型输出中取出 JSON 主体（```json 代码块优先，其次首个 { 到最后一个 }）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

/// 解析结构化输出；失败时返回带原文的错误描述
pub fn parse_structured<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    let json = extract_json(output).ok_or_else(|| format!("no JSON object in output: {output}"))?;
    serde_json::from_str(json).map_err(|e| format!("{e}: {json}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_aliases() {
        let r: IntentResult = parse_structured(r#"{"intent": "calc"}"#).unwrap();
        assert_eq!(r.intent, Intent::Calculation);
        let r: IntentResult = parse_structured(r#"{"intent": "chitchat"}"#).unwrap();
        assert_eq!(r.intent, Intent::SmallTalk);
        let r: IntentResult = parse_structured(r#"{"intent": "product_query"}"#).unwrap();
        assert_eq!(r.intent, Intent::ProductQuery);
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let out = "Sure!\n```json\n{\"decision\": \"call_calc\"}\n```";
        let r: DecisionResult = parse_structured(out).unwrap();
        assert_eq!(r.decision, Decision::CallCalc);
    }

    #[test]
    fn test_extract_json_with_surrounding_text() {
        let out = "Here you go: {\"calcExpression\": \" 5 + 10 \"} done";
        let slots: Slots = parse_structured::<Slots>(out).unwrap().normalized();
        assert_eq!(slots.calc_expression.as_deref(), Some("5 + 10"));
    }

    #[test]
    fn test_parse_structured_rejects_plain_text() {
        assert!(parse_structured::<IntentResult>("I think it is calc").is_err());
        assert!(parse_structured::<IntentResult>(r#"{"intent": "weather"}"#).is_err());
    }

    #[test]
    fn test_slots_normalized_drops_blank() {
        let slots = Slots {
            product_query: Some("   ".into()),
            outlet_area: Some(" SS2 ".into()),
            ..Default::default()
        }
        .normalized();
        assert!(slots.product_query.is_none());
        assert_eq!(slots.outlet_area.as_deref(), Some("SS2"));
    }
}
