//! 自然语言 -> SQL
//!
//! - KeywordSqlGenerator：按地区别名表生成参数化的 LIKE 查询（离线、确定性）
//! - LlmSqlGenerator：由模型生成 SQL，规整输出后把引号字面量提升为绑定参数，再交给闸门

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::core::ToolError;
use crate::llm::{LlmClient, LlmError};
use crate::planner::prompts::TEXT2SQL_PROMPT;

pub const OUTLET_TABLE: &str = "outlets";

pub const OUTLET_COLUMNS: &[&str] = &[
    "name",
    "city",
    "state",
    "postal_code",
    "address",
    "open_time",
    "close_time",
    "services",
];

/// 地区别名：(规范名, 变体)。规范名即 LIKE 的匹配值
pub const OUTLET_AREAS: &[(&str, &[&str])] = &[
    ("ampang", &["ampang"]),
    ("bandar sunway", &["bandar sunway", "sunway"]),
    ("bangi", &["bangi"]),
    ("bangsar", &["bangsar"]),
    ("cheras", &["cheras"]),
    ("cyberjaya", &["cyberjaya"]),
    ("damansara", &["damansara"]),
    ("kajang", &["kajang"]),
    ("klang", &["klang", "port klang"]),
    ("klcc", &["klcc"]),
    ("kuala lumpur", &["kuala lumpur", "kualalumpur", "kl"]),
    ("petaling jaya", &["petaling jaya", "petalingjaya", "pj"]),
    ("puchong", &["puchong"]),
    ("putrajaya", &["putrajaya"]),
    ("rawang", &["rawang"]),
    ("sepang", &["sepang"]),
    ("seri kembangan", &["seri kembangan"]),
    ("shah alam", &["shah alam"]),
    ("ss 2", &["ss2", "ss 2"]),
    ("subang jaya", &["subang jaya", "subangjaya", "subang"]),
];

fn normalize_question(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 全部匹配的地区（按表顺序，按词边界匹配）
pub fn match_outlet_areas(text: &str) -> Vec<(&'static str, &'static [&'static str])> {
    let padded = format!(" {} ", normalize_question(text));
    OUTLET_AREAS
        .iter()
        .filter(|(_, variants)| variants.iter().any(|v| padded.contains(&format!(" {v} "))))
        .copied()
        .collect()
}

pub fn match_outlet_area(text: &str) -> Option<(&'static str, &'static [&'static str])> {
    match_outlet_areas(text).into_iter().next()
}

/// 生成结果：SQL 文本与绑定参数
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeneratedSql {
    pub text: String,
    pub params: BTreeMap<String, String>,
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, question: &str) -> Result<GeneratedSql, ToolError>;

    fn name(&self) -> &str;
}

/// 关键词生成器
#[derive(Debug, Clone)]
pub struct KeywordSqlGenerator {
    limit: usize,
}

impl KeywordSqlGenerator {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    pub fn build(&self, question: &str) -> GeneratedSql {
        let mut clauses = Vec::new();
        let mut params = BTreeMap::new();
        for (canonical, _) in match_outlet_areas(question) {
            for field in ["name", "city"] {
                let key = format!("{field}_param_{}", clauses.len());
                clauses.push(format!("LOWER({field}) LIKE :{key}"));
                params.insert(key, format!("%{canonical}%"));
            }
        }
        let mut text = format!("SELECT {} FROM {OUTLET_TABLE}", OUTLET_COLUMNS.join(", "));
        if !clauses.is_empty() {
            text.push_str(" WHERE ");
            text.push_str(&clauses.join(" OR "));
        }
        text.push_str(&format!(" ORDER BY name LIMIT {}", self.limit));
        GeneratedSql { text, params }
    }
}

impl Default for KeywordSqlGenerator {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl SqlGenerator for KeywordSqlGenerator {
    async fn generate(&self, question: &str) -> Result<GeneratedSql, ToolError> {
        Ok(self.build(question))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

fn near_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(nearby|near|around)\b").expect("static regex"))
}

fn select_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bselect\b").expect("static regex"))
}

/// 把 near/around 改写为 in，压缩空白
pub fn prepare_question(question: &str) -> String {
    let cleaned = question.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return "List outlets.".to_string();
    }
    near_re().replace_all(&cleaned, "in").to_string()
}

/// 去掉代码块围栏，从第一个 SELECT 开始截取
pub fn normalize_generated_sql(output: &str) -> String {
    let mut text = output.trim();
    if text.starts_with("```") {
        let parts: Vec<&str> = text.split("```").collect();
        text = if parts.len() >= 3 { parts[1] } else { parts[parts.len() - 1] };
        text = text.trim_start_matches("sql").trim_start_matches("SQL");
    }
    match select_re().find(text) {
        Some(m) => text[m.start()..].trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// 把单引号字面量替换为 `:lit_N` 绑定参数（`''` 视为转义的单引号）
pub fn lift_literals(sql: &str) -> GeneratedSql {
    let chars: Vec<char> = sql.chars().collect();
    let mut text = String::with_capacity(sql.len());
    let mut params = BTreeMap::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\'' {
            text.push(chars[i]);
            i += 1;
            continue;
        }
        let mut value = String::new();
        let mut j = i + 1;
        let mut closed = false;
        while j < chars.len() {
            if chars[j] == '\'' {
                if chars.get(j + 1) == Some(&'\'') {
                    value.push('\'');
                    j += 2;
                    continue;
                }
                closed = true;
                break;
            }
            value.push(chars[j]);
            j += 1;
        }
        if !closed {
            // 未闭合：原样保留，由闸门拒绝
            text.extend(&chars[i..]);
            break;
        }
        let key = format!("lit_{}", params.len());
        text.push(':');
        text.push_str(&key);
        params.insert(key, value);
        i = j + 1;
    }
    GeneratedSql { text, params }
}

fn schema_description() -> String {
    format!("{OUTLET_TABLE}({})", OUTLET_COLUMNS.join(", "))
}

/// 模型生成器
pub struct LlmSqlGenerator {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
    limit: usize,
}

impl LlmSqlGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration, limit: usize) -> Self {
        Self {
            llm,
            timeout,
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(&self, question: &str) -> Result<GeneratedSql, ToolError> {
        let question = prepare_question(question);
        let limit = self.limit.to_string();
        let schema = schema_description();
        let prompt = TEXT2SQL_PROMPT.render(&[
            ("schema", schema.as_str()),
            ("question", question.as_str()),
            ("top_k", limit.as_str()),
        ]);
        let output = match tokio::time::timeout(self.timeout, self.llm.complete(&prompt.messages)).await {
            Ok(Ok(text)) => text,
            Ok(Err(LlmError::Unavailable(e))) => return Err(ToolError::ProviderUnavailable(e)),
            Ok(Err(LlmError::Timeout(ms))) => {
                return Err(ToolError::UpstreamTimeout(format!("text2sql timed out after {ms} ms")))
            }
            Ok(Err(e)) => return Err(ToolError::Upstream(e.to_string())),
            Err(_) => {
                return Err(ToolError::UpstreamTimeout(format!(
                    "text2sql timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
        };
        let sql = normalize_generated_sql(&output);
        if sql.is_empty() {
            return Err(ToolError::Upstream("Generated SQL was empty.".to_string()));
        }
        Ok(lift_literals(&sql))
    }

    fn name(&self) -> &str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HeuristicLlmClient, ScriptedLlmClient};

    #[test]
    fn test_match_areas_on_word_boundaries() {
        assert_eq!(match_outlet_area("Any outlets in PJ?").map(|a| a.0), Some("petaling jaya"));
        assert_eq!(match_outlet_area("SS 2, what's the opening time?").map(|a| a.0), Some("ss 2"));
        assert_eq!(match_outlet_area("klang valley").map(|a| a.0), Some("klang"));
        assert!(match_outlet_area("tumblers please").is_none());
    }

    #[test]
    fn test_keyword_generator_parameterizes() {
        let sql = KeywordSqlGenerator::default().build("outlets in kl");
        assert!(sql.text.contains("LOWER(name) LIKE :name_param_0 OR LOWER(city) LIKE :city_param_1"));
        assert!(sql.text.ends_with("ORDER BY name LIMIT 10"));
        assert_eq!(sql.params["name_param_0"], "%kuala lumpur%");
        assert!(!sql.text.contains('\''));
    }

    #[test]
    fn test_keyword_generator_without_area() {
        let sql = KeywordSqlGenerator::new(5).build("list all outlets");
        assert!(!sql.text.contains("WHERE"));
        assert!(sql.params.is_empty());
    }

    #[test]
    fn test_normalize_generated_sql() {
        assert_eq!(
            normalize_generated_sql("```sql\nSELECT name FROM outlets\n```"),
            "SELECT name FROM outlets"
        );
        assert_eq!(
            normalize_generated_sql("Here is the query: select name from outlets"),
            "select name from outlets"
        );
    }

    #[test]
    fn test_lift_literals() {
        let g = lift_literals("SELECT name FROM outlets WHERE LOWER(city) LIKE '%o''neil%' AND name = 'x'");
        assert_eq!(g.text, "SELECT name FROM outlets WHERE LOWER(city) LIKE :lit_0 AND name = :lit_1");
        assert_eq!(g.params["lit_0"], "%o'neil%");
        assert_eq!(g.params["lit_1"], "x");

        let g = lift_literals("SELECT name FROM outlets WHERE name = 'open");
        assert!(g.text.contains('\''));
    }

    #[test]
    fn test_prepare_question() {
        assert_eq!(prepare_question("outlets  near   Bangsar"), "outlets in Bangsar");
        assert_eq!(prepare_question("   "), "List outlets.");
    }

    #[tokio::test]
    async fn test_llm_generator_lifts_heuristic_output() {
        let gen = LlmSqlGenerator::new(Arc::new(HeuristicLlmClient), Duration::from_secs(1), 10);
        let sql = gen.generate("Is there an outlet near Petaling Jaya?").await.unwrap();
        assert!(!sql.text.contains('\''));
        assert!(sql.params.values().any(|v| v == "%petaling jaya%"));
    }

    #[tokio::test]
    async fn test_llm_generator_maps_unavailable() {
        let llm = ScriptedLlmClient::default();
        llm.push_err(LlmError::Unavailable("refused".into()));
        let gen = LlmSqlGenerator::new(Arc::new(llm), Duration::from_secs(1), 10);
        let err = gen.generate("outlets in kl").await.unwrap_err();
        assert_eq!(err.kind(), "provider_unavailable");
    }
}
