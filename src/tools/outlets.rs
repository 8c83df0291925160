//! 门店查询工具：text2sql -> 安全闸门 -> 存储执行

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::outlet_store::{OutletRow, OutletStore};
use crate::tools::registry::string_arg;
use crate::tools::sql_gate::SqlSafetyGate;
use crate::tools::text2sql::SqlGenerator;
use crate::tools::{Tool, ToolName, ToolOutput};

pub const DEFAULT_MAX_ROWS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct OutletsQueryResponse {
    pub query: String,
    pub sql: String,
    pub params: std::collections::BTreeMap<String, String>,
    pub rows: Vec<OutletRow>,
}

impl OutletsQueryResponse {
    pub fn message(&self) -> String {
        let Some(first) = self.rows.first() else {
            return "I didn't find matching outlets.".to_string();
        };
        let field = |key: &str| first.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
        let name = field("name").unwrap_or("That outlet");
        let hours = match (field("open_time"), field("close_time")) {
            (Some(open), Some(close)) => format!(" They open at {open} and close at {close}."),
            _ => String::new(),
        };
        let others: Vec<&str> = self
            .rows
            .iter()
            .skip(1)
            .take(3)
            .filter_map(|r| r.get("name").and_then(Value::as_str))
            .collect();
        if others.is_empty() {
            format!("{name} is available.{hours}")
        } else {
            format!("{name} is available.{hours} Other matches: {}.", others.join(", "))
        }
    }
}

pub struct OutletQueryTool {
    generator: Arc<dyn SqlGenerator>,
    gate: SqlSafetyGate,
    store: Arc<dyn OutletStore>,
    max_rows: usize,
}

impl OutletQueryTool {
    pub fn new(generator: Arc<dyn SqlGenerator>, store: Arc<dyn OutletStore>) -> Self {
        Self {
            generator,
            gate: SqlSafetyGate::outlets(),
            store,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub async fn query(&self, question: &str) -> Result<OutletsQueryResponse, ToolError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ToolError::Validation("Query cannot be empty.".to_string()));
        }
        let generated = self.generator.generate(question).await?;
        let candidate = self.gate.check(&generated.text, &generated.params)?;
        tracing::debug!(
            generator = self.generator.name(),
            sql = %candidate.text,
            tables = ?candidate.referenced_tables,
            "outlet query accepted"
        );
        let rows = self.store.execute(&candidate, self.max_rows).await?;
        Ok(OutletsQueryResponse {
            query: question.to_string(),
            sql: candidate.text,
            params: candidate.params,
            rows,
        })
    }
}

#[async_trait]
impl Tool for OutletQueryTool {
    fn name(&self) -> ToolName {
        ToolName::Outlets
    }

    fn description(&self) -> &str {
        "Look up outlets, locations and opening hours. Args: {\"query\": \"...\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let question = string_arg(&args, &["query", "question"])
            .ok_or_else(|| ToolError::Validation("Query cannot be empty.".to_string()))?;
        let response = self.query(&question).await?;
        let message = response.message();
        let data = serde_json::to_value(&response)
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        Ok(ToolOutput::new(data, message))
    }
}
