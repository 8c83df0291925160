//! SQL 安全闸门
//!
//! 生成的 SQL 在到达存储之前必须通过全部检查，任何一项不满足即拒绝（fail closed）：
//! 单条语句（只容忍末尾分号，不允许注释）、只有一个 SELECT、不含写/DDL 关键字、
//! 表与列都在白名单内、没有内联字符串字面量（用户值只能以 `:name` 绑定参数传入）。
//! 拒绝原因只写入 SafetyViolation 的内部描述，面向用户的消息是通用拒绝。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::core::ToolError;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "PRAGMA", "CREATE", "REPLACE", "DETACH",
    "VACUUM", "REINDEX", "TRUNCATE", "GRANT", "REVOKE",
];

const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "LIKE", "IN", "IS", "NULL", "AS", "ORDER", "BY",
    "GROUP", "HAVING", "LIMIT", "OFFSET", "ASC", "DESC", "DISTINCT", "BETWEEN", "JOIN", "INNER",
    "LEFT", "RIGHT", "OUTER", "CROSS", "ON", "CASE", "WHEN", "THEN", "ELSE", "END", "COLLATE",
    "NOCASE", "ESCAPE", "TRUE", "FALSE", "GLOB", "ALL",
];

const SQL_FUNCTIONS: &[&str] = &[
    "LOWER", "UPPER", "TRIM", "LTRIM", "RTRIM", "COUNT", "MIN", "MAX", "AVG", "SUM", "LENGTH",
    "SUBSTR", "COALESCE", "IFNULL", "INSTR", "ABS", "ROUND", "TIME",
];

/// 通过闸门的查询
#[derive(Debug, Clone, PartialEq)]
pub struct SqlCandidate {
    /// 去掉末尾分号后的语句
    pub text: String,
    /// 语句中实际引用的绑定参数
    pub params: BTreeMap<String, String>,
    pub referenced_tables: BTreeSet<String>,
    pub referenced_columns: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Quoted(String),
    Param(String),
    Number,
    Semicolon,
    LParen,
    Comma,
    Dot,
    Star,
    Symbol,
}

fn violation(detail: impl Into<String>) -> ToolError {
    ToolError::SafetyViolation(detail.into())
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(sql: &str) -> Result<Vec<Tok>, ToolError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '-' if next == Some('-') => return Err(violation("comments are not allowed")),
            '/' if next == Some('*') => return Err(violation("comments are not allowed")),
            '\'' => return Err(violation("inline string literals are not allowed")),
            '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '"')
                    .map(|p| start + p)
                    .ok_or_else(|| violation("unterminated quoted identifier"))?;
                tokens.push(Tok::Quoted(chars[start..end].iter().collect()));
                i = end + 1;
            }
            ':' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                if end == start {
                    return Err(violation("malformed bound parameter"));
                }
                tokens.push(Tok::Param(chars[start..end].iter().collect()));
                i = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Tok::Word(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Tok::Number);
            }
            ';' => {
                tokens.push(Tok::Semicolon);
                i += 1;
            }
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ',' => {
                tokens.push(Tok::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Tok::Dot);
                i += 1;
            }
            '*' => {
                tokens.push(Tok::Star);
                i += 1;
            }
            ')' | '=' | '<' | '>' | '!' | '+' | '-' | '/' | '%' | '|' => {
                tokens.push(Tok::Symbol);
                i += 1;
            }
            other => return Err(violation(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn upper(word: &str) -> String {
    word.to_ascii_uppercase()
}

fn is_keyword(word: &str) -> bool {
    SQL_KEYWORDS.contains(&upper(word).as_str())
}

/// 白名单式 SQL 校验器
#[derive(Debug, Clone)]
pub struct SqlSafetyGate {
    schema: HashMap<String, HashSet<String>>,
}

impl SqlSafetyGate {
    pub fn new<I, T, C>(schema: I) -> Self
    where
        I: IntoIterator<Item = (T, Vec<C>)>,
        T: Into<String>,
        C: Into<String>,
    {
        Self {
            schema: schema
                .into_iter()
                .map(|(table, columns)| {
                    (
                        table.into().to_lowercase(),
                        columns.into_iter().map(|c| c.into().to_lowercase()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// outlets 表的白名单
    pub fn outlets() -> Self {
        Self::new([(
            crate::tools::text2sql::OUTLET_TABLE,
            crate::tools::text2sql::OUTLET_COLUMNS.to_vec(),
        )])
    }

    pub fn check(&self, sql: &str, params: &BTreeMap<String, String>) -> Result<SqlCandidate, ToolError> {
        let mut tokens = tokenize(sql)?;
        if tokens.is_empty() {
            return Err(violation("empty query"));
        }

        // (a) 单条语句：分号只能出现在末尾
        while tokens.last() == Some(&Tok::Semicolon) {
            tokens.pop();
        }
        if tokens.contains(&Tok::Semicolon) {
            return Err(violation("multiple statements"));
        }

        // (b) 单个 SELECT
        let words: Vec<String> = tokens
            .iter()
            .filter_map(|t| match t {
                Tok::Word(w) => Some(upper(w)),
                _ => None,
            })
            .collect();
        if !matches!(tokens.first(), Some(Tok::Word(w)) if upper(w) == "SELECT") {
            return Err(violation("statement must start with SELECT"));
        }
        if words.iter().filter(|w| w.as_str() == "SELECT").count() != 1 {
            return Err(violation("exactly one SELECT is allowed"));
        }

        // (c) 禁用关键字
        if let Some(w) = words.iter().find(|w| FORBIDDEN_KEYWORDS.contains(&w.as_str())) {
            return Err(violation(format!("forbidden keyword {w}")));
        }

        // (d) 表与列白名单
        let (tables, aliases) = self.collect_tables(&tokens)?;
        let columns = self.collect_columns(&tokens, &tables, &aliases)?;

        // (e) 参数必须全部绑定
        let mut bound = BTreeMap::new();
        for t in &tokens {
            if let Tok::Param(name) = t {
                let value = params
                    .get(name)
                    .ok_or_else(|| violation(format!("unbound parameter :{name}")))?;
                bound.insert(name.clone(), value.clone());
            }
        }

        let text = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string();
        Ok(SqlCandidate {
            text,
            params: bound,
            referenced_tables: tables,
            referenced_columns: columns,
        })
    }

    fn ident(tok: &Tok) -> Option<String> {
        match tok {
            Tok::Word(w) if !is_keyword(w) => Some(w.to_lowercase()),
            Tok::Quoted(q) => Some(q.to_lowercase()),
            _ => None,
        }
    }

    /// FROM / JOIN 之后的表名（含逗号列表）及其别名
    fn collect_tables(&self, tokens: &[Tok]) -> Result<(BTreeSet<String>, HashMap<String, String>), ToolError> {
        let mut tables = BTreeSet::new();
        let mut aliases = HashMap::new();
        let mut i = 0;
        while i < tokens.len() {
            let starts_list = matches!(&tokens[i], Tok::Word(w) if matches!(upper(w).as_str(), "FROM" | "JOIN"));
            if !starts_list {
                i += 1;
                continue;
            }
            i += 1;
            loop {
                let table = tokens
                    .get(i)
                    .and_then(Self::ident)
                    .ok_or_else(|| violation("expected table name"))?;
                if !self.schema.contains_key(&table) {
                    return Err(violation(format!("table {table} is not allowed")));
                }
                tables.insert(table.clone());
                i += 1;
                if matches!(tokens.get(i), Some(Tok::Word(w)) if upper(w) == "AS") {
                    i += 1;
                }
                if let Some(alias) = tokens.get(i).and_then(Self::ident) {
                    aliases.insert(alias, table.clone());
                    i += 1;
                }
                if tokens.get(i) == Some(&Tok::Comma) {
                    i += 1;
                    continue;
                }
                break;
            }
        }
        if tables.is_empty() {
            return Err(violation("query must read from an allowed table"));
        }
        Ok((tables, aliases))
    }

    fn collect_columns(
        &self,
        tokens: &[Tok],
        tables: &BTreeSet<String>,
        aliases: &HashMap<String, String>,
    ) -> Result<BTreeSet<String>, ToolError> {
        let allowed: HashSet<&String> = tables
            .iter()
            .filter_map(|t| self.schema.get(t))
            .flatten()
            .collect();
        let mut column_aliases: HashSet<String> = HashSet::new();
        let mut columns = BTreeSet::new();
        let mut in_table_list = false;

        for (i, tok) in tokens.iter().enumerate() {
            let prev = if i > 0 { tokens.get(i - 1) } else { None };
            let next = tokens.get(i + 1);

            if let Tok::Word(w) = tok {
                match upper(w).as_str() {
                    "FROM" | "JOIN" => {
                        in_table_list = true;
                        continue;
                    }
                    "WHERE" | "ORDER" | "GROUP" | "HAVING" | "LIMIT" | "ON" => in_table_list = false,
                    _ => {}
                }
                if is_keyword(w) {
                    continue;
                }
                if next == Some(&Tok::LParen) {
                    if !SQL_FUNCTIONS.contains(&upper(w).as_str()) {
                        return Err(violation(format!("function {w} is not allowed")));
                    }
                    continue;
                }
            }
            if in_table_list {
                continue;
            }
            let Some(name) = Self::ident(tok) else {
                continue;
            };
            // 限定名 `t.col` 的前半部分
            if next == Some(&Tok::Dot) {
                if !tables.contains(&name) && !aliases.contains_key(&name) {
                    return Err(violation(format!("unknown table qualifier {name}")));
                }
                continue;
            }
            // `AS x` 定义列别名
            if matches!(prev, Some(Tok::Word(p)) if upper(p) == "AS") {
                column_aliases.insert(name);
                continue;
            }
            if column_aliases.contains(&name) {
                continue;
            }
            if !allowed.contains(&name) {
                return Err(violation(format!("column {name} is not allowed")));
            }
            columns.insert(name);
        }
        Ok(columns)
    }
}
