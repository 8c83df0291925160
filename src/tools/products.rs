//! 产品检索工具（RAG）
//!
//! 查询文本 -> 嵌入 -> 向量索引 top-K -> 可选摘要。无命中仍是成功（空列表）；
//! 摘要尽力而为，失败或为空时不带摘要。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::llm::{EmbeddingProvider, LlmClient};
use crate::planner::prompts::PRODUCT_SUMMARY_PROMPT;
use crate::tools::registry::string_arg;
use crate::tools::vector::{ProductDocument, VectorIndex};
use crate::tools::{Tool, ToolName, ToolOutput};

const MAX_SNIPPET_CHARS: usize = 400;
const SUMMARY_DOCS: usize = 4;
const SUMMARY_DOC_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductHit {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_title: Option<String>,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductSearchResponse {
    pub query: String,
    #[serde(rename = "topK")]
    pub top_k: Vec<ProductHit>,
    pub summary: Option<String>,
}

impl ProductSearchResponse {
    /// 面向用户的一句话结果
    pub fn message(&self) -> String {
        if self.top_k.is_empty() {
            return "I couldn't find matching drinkware right now.".to_string();
        }
        let titles: Vec<&str> = self.top_k.iter().take(3).map(|h| h.title.as_str()).collect();
        match &self.summary {
            Some(summary) => format!("I found these drinkware options: {}. {summary}", titles.join(", ")),
            None => format!("I found these drinkware options: {}.", titles.join(", ")),
        }
    }
}

fn coerce_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max - 3).collect();
    format!("{}...", kept.trim_end())
}

fn to_hit(doc: &ProductDocument, score: f32) -> ProductHit {
    let tags = match doc.metadata.get("tags") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let snippet = Some(doc.content.trim())
        .filter(|s| !s.is_empty())
        .map(|s| truncate_chars(s, MAX_SNIPPET_CHARS));
    ProductHit {
        title: doc.title().unwrap_or("Unknown product").to_string(),
        variant_title: doc.meta_str("variantTitle").map(str::to_string),
        score: score.clamp(0.0, 1.0),
        url: doc
            .meta_str("productUrl")
            .or_else(|| doc.meta_str("url"))
            .map(str::to_string),
        price: coerce_f64(doc.metadata.get("price")),
        available: doc.metadata.get("available").and_then(Value::as_bool),
        tags,
        snippet,
    }
}

/// 摘要上下文：每行 `- title | price | snippet`
pub fn build_summary_context(documents: &[ProductDocument]) -> String {
    documents
        .iter()
        .filter(|d| !d.content.trim().is_empty())
        .take(SUMMARY_DOCS)
        .map(|d| {
            let price = coerce_f64(d.metadata.get("price"))
                .map(|p| format!("RM{}", crate::tools::calculator::format_number(p)))
                .unwrap_or_else(|| "n/a".to_string());
            let content = truncate_chars(d.content.trim(), SUMMARY_DOC_CHARS).replace('\n', " ");
            format!("- {} | {} | {}", d.title().unwrap_or("Unknown product"), price, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
pub trait ProductSummarizer: Send + Sync {
    async fn summarize(&self, query: &str, documents: &[ProductDocument]) -> Result<String, String>;
}

/// 模板摘要（离线）
#[derive(Debug, Default)]
pub struct TemplateSummarizer;

#[async_trait]
impl ProductSummarizer for TemplateSummarizer {
    async fn summarize(&self, query: &str, documents: &[ProductDocument]) -> Result<String, String> {
        let titles: Vec<&str> = documents.iter().filter_map(|d| d.title()).take(4).collect();
        if titles.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("Top matches for '{}' include: {}.", query, titles.join(", ")))
    }
}

/// 模型摘要
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }
}

#[async_trait]
impl ProductSummarizer for LlmSummarizer {
    async fn summarize(&self, query: &str, documents: &[ProductDocument]) -> Result<String, String> {
        let context = build_summary_context(documents);
        if context.is_empty() {
            return Ok(String::new());
        }
        let prompt = PRODUCT_SUMMARY_PROMPT.render(&[("query", query), ("context", &context)]);
        match tokio::time::timeout(self.timeout, self.llm.complete(&prompt.messages)).await {
            Ok(Ok(text)) => Ok(text.trim().to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("summary timed out after {} ms", self.timeout.as_millis())),
        }
    }
}

/// 产品检索工具：args `{"query": "...", "k": 3}`
pub struct ProductSearchTool {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    summarizer: Option<Arc<dyn ProductSummarizer>>,
    top_k: usize,
    summary_context_k: usize,
}

impl ProductSearchTool {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            summarizer: None,
            top_k: 3,
            summary_context_k: 8,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ProductSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub async fn search(&self, query: &str, k: usize) -> Result<ProductSearchResponse, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ToolError::Validation("Query cannot be empty.".to_string()));
        }
        let vector = self
            .embedder
            .embed(query)
            .await
            .map_err(ToolError::ProviderUnavailable)?;
        let effective_k = k.max(self.summary_context_k);
        let results = self.index.search(&vector, effective_k).await?;

        let top_k: Vec<ProductHit> = results
            .iter()
            .take(k)
            .map(|r| to_hit(&r.document, r.score))
            .collect();

        let summary = match (&self.summarizer, results.is_empty()) {
            (Some(summarizer), false) => {
                let documents: Vec<ProductDocument> =
                    results.into_iter().map(|r| r.document).collect();
                match summarizer.summarize(query, &documents).await {
                    Ok(s) if !s.trim().is_empty() => Some(s),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "product summary failed");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(ProductSearchResponse {
            query: query.to_string(),
            top_k,
            summary,
        })
    }
}

#[async_trait]
impl Tool for ProductSearchTool {
    fn name(&self) -> ToolName {
        ToolName::Products
    }

    fn description(&self) -> &str {
        "Search the drinkware catalog. Args: {\"query\": \"...\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = string_arg(&args, &["query", "productQuery"])
            .ok_or_else(|| ToolError::Validation("Query cannot be empty.".to_string()))?;
        let k = args
            .get("k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(self.top_k)
            .max(1);
        let response = self.search(&query, k).await?;
        let message = response.message();
        let data = serde_json::to_value(&response)
            .map_err(|e| ToolError::Upstream(e.to_string()))?;
        Ok(ToolOutput::new(data, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{HashEmbedder, LlmError, ScriptedLlmClient};
    use crate::tools::vector::InMemoryProductIndex;
    use serde_json::json;

    async fn catalog_tool() -> ProductSearchTool {
        let embedder = Arc::new(HashEmbedder::default());
        let docs = vec![
            ProductDocument::new(
                "Double wall stainless steel tumbler keeps drinks cold",
                json!({"productTitle": "All Day Cup", "price": "55.00", "tags": ["tumbler"]}),
            ),
            ProductDocument::new("Ceramic mug with bamboo lid", json!({"title": "Ceramic Mug", "price": 39})),
            ProductDocument::new("x".repeat(500), json!({"name": "Long Bottle"})),
        ];
        let index = InMemoryProductIndex::build(docs, embedder.as_ref()).await.unwrap();
        ProductSearchTool::new(embedder, Arc::new(index))
    }

    #[tokio::test]
    async fn test_search_returns_clipped_hits() {
        let tool = catalog_tool().await;
        let res = tool.search("stainless tumbler", 3).await.unwrap();
        assert_eq!(res.top_k[0].title, "All Day Cup");
        assert_eq!(res.top_k[0].price, Some(55.0));
        assert!(res.top_k.iter().all(|h| (0.0..=1.0).contains(&h.score)));
        let long = res.top_k.iter().find(|h| h.title == "Long Bottle").unwrap();
        let snippet = long.snippet.as_ref().unwrap();
        assert_eq!(snippet.chars().count(), 400);
        assert!(snippet.ends_with("..."));
        assert!(res.summary.is_none());
    }

    #[tokio::test]
    async fn test_empty_index_is_success() {
        let embedder = Arc::new(HashEmbedder::default());
        let tool = ProductSearchTool::new(embedder, Arc::new(InMemoryProductIndex::default()));
        let out = tool.execute(json!({"query": "tumbler"})).await.unwrap();
        assert_eq!(out.data["topK"], json!([]));
        assert_eq!(out.message, "I couldn't find matching drinkware right now.");
    }

    #[tokio::test]
    async fn test_template_summary() {
        let tool = catalog_tool()
            .await
            .with_summarizer(Arc::new(TemplateSummarizer))
            .with_top_k(1);
        let out = tool.execute(json!({"query": "tumbler"})).await.unwrap();
        assert_eq!(out.data["topK"].as_array().unwrap().len(), 1);
        let summary = out.data["summary"].as_str().unwrap();
        assert!(summary.starts_with("Top matches for 'tumbler' include: All Day Cup"));
        assert!(out.message.contains(summary));
    }

    #[tokio::test]
    async fn test_summary_failure_is_best_effort() {
        let llm = ScriptedLlmClient::default();
        llm.push_err(LlmError::Unavailable("down".into()));
        let tool = catalog_tool()
            .await
            .with_summarizer(Arc::new(LlmSummarizer::new(Arc::new(llm), Duration::from_secs(1))));
        let res = tool.search("mug", 2).await.unwrap();
        assert!(!res.top_k.is_empty());
        assert!(res.summary.is_none());
    }

    #[tokio::test]
    async fn test_blank_query_is_validation_error() {
        let tool = catalog_tool().await;
        let err = tool.execute(json!({"query": "  "})).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_summary_context_format() {
        let docs = vec![ProductDocument::new("Steel\ntumbler", json!({"title": "Cup", "price": 55}))];
        assert_eq!(build_summary_context(&docs), "- Cup | RM55 | Steel tumbler");
    }
}
