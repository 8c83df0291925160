//! 规划器提示词模板
//!
//! 每个模板有稳定的 prompt_id；渲染结果首行为 `[prompt:<id>]`，便于日志与离线后端识别任务。
//! 变量以 `{name}` 占位，缺失的变量渲染为空串。

use std::sync::OnceLock;

use regex::Regex;

use crate::memory::Message;

/// 结构化提示词模板
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub id: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

/// 渲染后的提示词
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub id: &'static str,
    pub messages: Vec<Message>,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[a-z_]+\}").expect("static regex"))
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> RenderedPrompt {
        let mut user = self.user.to_string();
        for (key, value) in vars {
            user = user.replace(&format!("{{{key}}}"), value);
        }
        let user = placeholder_re().replace_all(&user, "").trim().to_string();
        RenderedPrompt {
            id: self.id,
            messages: vec![
                Message::system(format!("{}\n{}", prompt_marker(self.id), self.system.trim())),
                Message::user(user),
            ],
        }
    }
}

/// 首行标记
pub fn prompt_marker(id: &str) -> String {
    format!("[prompt:{id}]")
}

/// 从消息列表中识别 prompt_id（读取 system 消息首行）
pub fn detect_prompt_id(messages: &[Message]) -> Option<&str> {
    let first = messages.first()?.content.lines().next()?;
    first.strip_prefix("[prompt:")?.strip_suffix(']')
}

/// 取出 `Label:` 之后、下一个空行之前的内容
pub fn section<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let start = text.find(label)? + label.len();
    let rest = text[start..].trim_start_matches(' ');
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n\n").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

pub const LABEL_CONVERSATION: &str = "Conversation:";
pub const LABEL_USER_MESSAGE: &str = "Latest user message:";
pub const LABEL_INTENT: &str = "Intent:";
pub const LABEL_SLOTS: &str = "Slots:";
pub const LABEL_MISSING: &str = "Missing:";
pub const LABEL_TOOL_RESULTS: &str = "Tool results:";
pub const LABEL_QUESTION: &str = "Question:";

pub const INTENT_PROMPT: PromptTemplate = PromptTemplate {
    id: "planner.intent.v1",
    system: r#"
You are the routing planner of a coffee-chain assistant.
Classify the latest user request into exactly one intent:
- calculation: arithmetic or calculator queries, including `/calc`.
- product_query: drinkware or merchandise requests.
- outlet_query: store location, opening hours, or outlet-specific questions.
- small_talk: greetings or chit-chat that need no tool.
- ambiguous: anything else.
Reply with JSON only: {"intent": "<intent>", "rationale": "<short reason>"}"#,
    user: "Conversation:\n{conversation}\n\nLatest user message:\n{user_message}",
};

pub const SLOT_PROMPT: PromptTemplate = PromptTemplate {
    id: "planner.slots.v1",
    system: r#"
You extract structured slots for the planner. Only capture values the user states explicitly.
- calcExpression: arithmetic expression to evaluate (numbers, + - * / ^ %, parentheses).
- productQuery: keywords describing the desired drinkware or merchandise.
- outletArea: city, area, or postcode.
- outletName: full or partial outlet name.
Never invent values. Reply with JSON only, omitting unknown slots."#,
    user: "Intent:\n{intent}\n\nConversation:\n{conversation}\n\nLatest user message:\n{user_message}",
};

pub const DECISION_PROMPT: PromptTemplate = PromptTemplate {
    id: "planner.decision.v1",
    system: r#"
You choose the next planner action. Options:
- call_calc, call_products, call_outlets: run that tool with the extracted slots.
- ask_follow_up: required information is missing (listed under Missing).
- respond: the tool results already answer the user.
- respond_smalltalk: no tool is needed.
Never call a tool whose result is already listed. Reply with JSON only: {"decision": "<action>"}"#,
    user: "Intent:\n{intent}\n\nSlots:\n{slots_json}\n\nMissing:\n{missing}\n\nTool results:\n{tool_summary}\n\nConversation:\n{conversation}\n\nLatest user message:\n{user_message}",
};

pub const FOLLOW_UP_PROMPT: PromptTemplate = PromptTemplate {
    id: "planner.follow_up.v1",
    system: r#"
Ask the user one short clarifying question so the planner can continue.
Name the missing information explicitly. Reply with JSON only: {"question": "<question>"}"#,
    user: "Intent:\n{intent}\n\nMissing:\n{missing}\n\nSlots:\n{slots_json}\n\nConversation:\n{conversation}\n\nLatest user message:\n{user_message}",
};

pub const SYNTHESIS_PROMPT: PromptTemplate = PromptTemplate {
    id: "planner.synthesis.v1",
    system: r#"
Write the assistant's final reply using only the tool results provided.
Keep it to two or three sentences. Prices are in Malaysian Ringgit, formatted like RM55.
Reply with JSON only: {"message": "<reply>", "followUp": "<optional question>"}"#,
    user: "Intent:\n{intent}\n\nSlots:\n{slots_json}\n\nTool results:\n{tool_summary}\n\nConversation:\n{conversation}\n\nLatest user message:\n{user_message}",
};

pub const PRODUCT_SUMMARY_PROMPT: PromptTemplate = PromptTemplate {
    id: "products.summary.v1",
    system: r#"
You are a product specialist for drinkware. Answer the customer using only the supplied product context.
Keep the reply to two concise sentences and mention product titles. Prices are in RM without trailing decimals.
Reply with plain text."#,
    user: "Question:\n{query}\n\nProduct context:\n{context}",
};

pub const TEXT2SQL_PROMPT: PromptTemplate = PromptTemplate {
    id: "outlets.text2sql.v1",
    system: r#"
You are an expert SQL generator for the outlets database.
Constraints:
- Return only a single SQL query starting with SELECT. No explanations, comments, or code fences.
- Use only the `outlets` table and list columns explicitly.
- Use LOWER(column) LIKE '%value%' for fuzzy matching of names or cities.
- Always end with LIMIT {top_k}.
- Never modify data."#,
    user: "Schema:\n{schema}\n\nQuestion:\n{question}\n\nLimit:\n{top_k}",
};
