//! 产品向量索引
//!
//! VectorIndex 只负责“查询向量 -> 按相似度排序的文档”；InMemoryProductIndex 从 JSON 目录文件加载，
//! 启动时用嵌入提供方编码全部文档。相似度相同的文档保持目录中的先后顺序。

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::ToolError;
use crate::llm::{cosine_similarity, EmbeddingProvider};

/// 目录中的一条产品文档
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductDocument {
    #[serde(alias = "page_content", alias = "text")]
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ProductDocument {
    pub fn new(content: impl Into<String>, metadata: Value) -> Self {
        Self {
            content: content.into(),
            metadata: match metadata {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// productTitle / title / name 依次回退
    pub fn title(&self) -> Option<&str> {
        self.meta_str("productTitle")
            .or_else(|| self.meta_str("title"))
            .or_else(|| self.meta_str("name"))
    }
}

#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: ProductDocument,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 返回至多 k 条，分数降序
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>, ToolError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemoryProductIndex {
    entries: Vec<(ProductDocument, Vec<f32>)>,
}

impl InMemoryProductIndex {
    pub fn from_embedded(entries: Vec<(ProductDocument, Vec<f32>)>) -> Self {
        Self { entries }
    }

    /// 用嵌入提供方编码全部文档
    pub async fn build(
        documents: Vec<ProductDocument>,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Self, ToolError> {
        let mut entries = Vec::with_capacity(documents.len());
        for doc in documents {
            let text = match doc.title() {
                Some(title) => format!("{title}\n{}", doc.content),
                None => doc.content.clone(),
            };
            let vector = embedder
                .embed(&text)
                .await
                .map_err(ToolError::ProviderUnavailable)?;
            entries.push((doc, vector));
        }
        Ok(Self { entries })
    }

    /// 从 JSON 目录文件（文档数组）加载
    pub async fn load_json(
        path: impl AsRef<Path>,
        embedder: &dyn EmbeddingProvider,
    ) -> Result<Self, ToolError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ToolError::ProviderUnavailable(format!(
                "product catalog {} is not available: {e}",
                path.display()
            ))
        })?;
        let documents: Vec<ProductDocument> = serde_json::from_str(&raw).map_err(|e| {
            ToolError::ProviderUnavailable(format!("invalid product catalog: {e}"))
        })?;
        tracing::info!(path = %path.display(), documents = documents.len(), "product catalog loaded");
        Self::build(documents, embedder).await
    }
}

#[async_trait]
impl VectorIndex for InMemoryProductIndex {
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredDocument>, ToolError> {
        let mut scored: Vec<ScoredDocument> = self
            .entries
            .iter()
            .map(|(doc, vector)| ScoredDocument {
                document: doc.clone(),
                score: cosine_similarity(query, vector),
            })
            .collect();
        // sort_by 是稳定排序：同分保持目录顺序
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
