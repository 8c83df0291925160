//! 槽位规则：缺失判定、产品查询是否过于笼统、聚合类问题识别、门店追问的上下文增强

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::memory::{ConversationState, Role};
use crate::planner::{Intent, Slots};

const PRODUCT_GENERIC_TOKENS: &[&str] = &[
    "drinkware", "product", "products", "info", "information", "details", "options", "option",
    "catalog", "catalogue", "recommendation", "recommendations", "show", "list", "anything",
    "something", "ideas", "suggestions", "suggestion",
];

const PRODUCT_DESCRIPTOR_HINTS: &[&str] = &[
    "tumbler", "tumblers", "cup", "cups", "mug", "mugs", "bottle", "bottles", "glass", "steel",
    "ceramic", "insulated", "thermal", "travel", "kids", "gift", "blue", "black", "matte",
    "gradient", "limited", "series", "edition", "set", "bundle", "handle", "strap", "sleeve",
    "corak", "malaysia", "marble", "double", "wall", "vacuum",
];

const PRODUCT_COMPARATOR_HINTS: &[&str] = &[
    "under", "below", "over", "above", "less", "more", "cheaper", "expensive", "between", "around",
    "budget", "price",
];

const SINGLE_WORD_GENERIC: &[&str] = &["drinkware", "product", "products", "catalog", "catalogue"];

/// 上一轮助手回复写入增强查询时的最大字符数
const ASSISTANT_CONTEXT_CHARS: usize = 320;

/// 产品查询是否过于笼统，需要先追问
pub fn needs_product_clarification(query: Option<&str>) -> bool {
    let Some(query) = query else {
        return true;
    };
    let normalized: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.is_empty() {
        return true;
    }
    if normalized.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    if tokens
        .iter()
        .any(|t| PRODUCT_COMPARATOR_HINTS.contains(t) || PRODUCT_DESCRIPTOR_HINTS.contains(t))
    {
        return false;
    }
    if tokens.len() == 1 {
        return SINGLE_WORD_GENERIC.contains(&tokens[0]);
    }
    tokens.len() <= 4 && tokens.iter().all(|t| PRODUCT_GENERIC_TOKENS.contains(t))
}

fn aggregation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(how\s+many|number\s+of|count|average|avg|minimum|maximum|min|max|most|least)\b")
            .expect("static regex")
    })
}

/// 计数 / 平均 / 最值类的产品问题（检索只返回样本，不能给出全量结论）
pub fn is_product_aggregation_query(message: &str) -> bool {
    aggregation_re().is_match(&message.to_lowercase())
}

/// 当前意图缺失的必需槽位名；为空表示可以调用工具
pub fn missing_slots(intent: Intent, slots: &Slots, state: &ConversationState) -> Vec<&'static str> {
    match intent {
        Intent::Calculation if slots.calc_expression.is_none() => vec!["calcExpression"],
        Intent::ProductQuery if needs_product_clarification(slots.product_query.as_deref()) => {
            vec!["productQuery"]
        }
        Intent::OutletQuery
            if slots.outlet_area.is_none()
                && slots.outlet_name.is_none()
                && state.prior_outlets().is_none() =>
        {
            vec!["outletArea", "outletName"]
        }
        _ => Vec::new(),
    }
}

fn latest_user_message(state: &ConversationState) -> Option<&str> {
    state
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
}

/// 最近一条用户消息之前的助手回复，超长时按词截断
fn last_assistant_summary(state: &ConversationState) -> String {
    let Some(latest) = state.messages.iter().rposition(|m| m.role == Role::User) else {
        return String::new();
    };
    let Some(message) = state.messages[..latest]
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
    else {
        return String::new();
    };
    let summary = message.content.trim();
    if summary.chars().count() <= ASSISTANT_CONTEXT_CHARS {
        return summary.to_string();
    }
    let cut: String = summary.chars().take(ASSISTANT_CONTEXT_CHARS - 3).collect();
    let truncated = cut.rsplit_once(' ').map(|(head, _)| head).unwrap_or(&cut);
    format!("{}...", truncated.trim())
}

/// 门店追问的查询文本：带上上一次的问题、助手回复与已提到的门店名，
/// 让 text2sql 能解析"那它几点关门"之类的指代。只读取提交的历史与其对应的快照。
pub fn build_outlets_query(state: &ConversationState) -> String {
    let Some(latest) = latest_user_message(state) else {
        return String::new();
    };
    let prior = state.prior_outlets();
    let previous = prior.map(|p| p.question.as_str()).unwrap_or_default();
    let assistant = last_assistant_summary(state);

    let rows: &[Value] = prior
        .and_then(|p| p.result.get("rows"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    if previous.is_empty() && rows.is_empty() && assistant.is_empty() {
        return latest.to_string();
    }

    let mut names: Vec<&str> = Vec::new();
    let mut cities: Vec<&str> = Vec::new();
    for row in rows {
        let field = |k: &str| row.get(k).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty());
        if let Some(city) = field("city") {
            if !cities.iter().any(|c| c.eq_ignore_ascii_case(city)) {
                cities.push(city);
            }
        }
        if let Some(name) = field("name") {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if names.len() >= 3 && cities.len() >= 3 {
            break;
        }
    }

    let mut sentences: Vec<String> = Vec::new();
    let mut add = |prefix: &str, content: &str| {
        let text = content.trim();
        if text.is_empty() {
            return;
        }
        let mut sentence = format!("{prefix}{text}");
        if !sentence.ends_with('.') {
            sentence.push('.');
        }
        if !sentences.contains(&sentence) {
            sentences.push(sentence);
        }
    };
    add("Previous outlets question: ", previous);
    add("Previous assistant response: ", &assistant);
    if !names.is_empty() {
        let joined = names.iter().take(3).copied().collect::<Vec<_>>().join(", ");
        add("Previous results mentioned: ", &joined);
    } else if !cities.is_empty() {
        let joined = cities.iter().take(3).copied().collect::<Vec<_>>().join(", ");
        add("Previous results covered cities: ", &joined);
    }

    if sentences.is_empty() {
        return latest.to_string();
    }
    format!("{} Follow-up question: {latest}", sentences.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Message, OutletsSnapshot};
    use serde_json::json;

    #[test]
    fn test_generic_product_queries_need_clarification() {
        assert!(needs_product_clarification(None));
        assert!(needs_product_clarification(Some("products")));
        assert!(needs_product_clarification(Some("show options")));
        assert!(needs_product_clarification(Some("product info")));
        assert!(!needs_product_clarification(Some("show me options")));
        assert!(needs_product_clarification(Some("?!")));
        assert!(!needs_product_clarification(Some("insulated tumbler")));
        assert!(!needs_product_clarification(Some("something under RM50")));
        assert!(!needs_product_clarification(Some("anything cheaper")));
    }

    #[test]
    fn test_aggregation_detection() {
        assert!(is_product_aggregation_query("How many tumblers do you have?"));
        assert!(is_product_aggregation_query("what's the average price"));
        assert!(!is_product_aggregation_query("show me a blue mug"));
        assert!(!is_product_aggregation_query("maximal"));
    }

    fn remember_outlets(state: &mut ConversationState, question: &str, reply: &str, rows: serde_json::Value) {
        state.outlets_context.remember(OutletsSnapshot {
            question: question.to_string(),
            reply: reply.to_string(),
            result: json!({ "query": question, "rows": rows }),
        });
    }

    #[test]
    fn test_missing_slots_for_outlets_uses_memory() {
        let mut state = ConversationState::new("s");
        state.messages = vec![
            Message::user("Any outlets in KL?"),
            Message::assistant("ZUS Coffee KLCC is available."),
            Message::user("when does it close"),
        ];
        let slots = Slots::default();
        assert_eq!(
            missing_slots(Intent::OutletQuery, &slots, &state),
            vec!["outletArea", "outletName"]
        );
        remember_outlets(&mut state, "Any outlets in KL?", "ZUS Coffee KLCC is available.", json!([]));
        assert!(missing_slots(Intent::OutletQuery, &slots, &state).is_empty());
        assert!(missing_slots(Intent::SmallTalk, &slots, &state).is_empty());
        assert_eq!(missing_slots(Intent::Calculation, &slots, &state), vec!["calcExpression"]);
    }

    #[test]
    fn test_outlets_query_without_history_is_latest_message() {
        let mut state = ConversationState::new("s");
        state.messages = vec![Message::user("Is there an outlet in SS 2?")];
        assert_eq!(build_outlets_query(&state), "Is there an outlet in SS 2?");
    }

    #[test]
    fn test_outlets_query_enriched_with_previous_turn() {
        let mut state = ConversationState::new("s");
        let reply = "ZUS Coffee SS 2 is available. They open at 08:00 and close at 22:00.";
        state.messages = vec![
            Message::user("Is there an outlet in SS 2?"),
            Message::assistant(reply),
            Message::user("what time does it close"),
        ];
        remember_outlets(
            &mut state,
            "Is there an outlet in SS 2?",
            reply,
            json!([{"name": "ZUS Coffee SS 2", "city": "Petaling Jaya"}]),
        );

        let query = build_outlets_query(&state);
        assert!(query.starts_with("Previous outlets question: Is there an outlet in SS 2?"));
        assert!(query.contains("Previous results mentioned: ZUS Coffee SS 2."));
        assert!(query.ends_with("Follow-up question: what time does it close"));
    }

    #[test]
    fn test_outlets_query_ignores_context_outside_history() {
        let mut state = ConversationState::new("s");
        remember_outlets(&mut state, "Any outlets in KL?", "ZUS Coffee KLCC is available.", json!([]));
        state.messages = vec![Message::user("Any outlets in KL?")];
        assert_eq!(build_outlets_query(&state), "Any outlets in KL?");
    }

    #[test]
    fn test_assistant_summary_truncated_on_word_boundary() {
        let mut state = ConversationState::new("s");
        state.messages = vec![
            Message::assistant("word ".repeat(100)),
            Message::user("next"),
        ];
        let summary = last_assistant_summary(&state);
        assert!(summary.ends_with("word..."));
        assert!(summary.chars().count() <= ASSISTANT_CONTEXT_CHARS);
    }
}
