//! 服务构建器：按配置组装模型、工具、状态机与事件流
//!
//! REPL 与 Web 两种入口共用同一套组装逻辑；测试可通过 with_* 注入确定性的协作方。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, CalcMode, EmbeddingBackend, Text2SqlMode};
use crate::core::event_stream::SessionEventStream;
use crate::core::orchestrator::ChatService;
use crate::core::session::SessionRegistry;
use crate::llm::{EmbeddingProvider, HashEmbedder, HeuristicLlmClient, LlmClient, OpenAiClient, OpenAiEmbedder};
use crate::planner::{PlannerConfig, PlannerModel, PlannerStateMachine};
use crate::tools::{
    CalculatorTool, HttpCalculator, InMemoryProductIndex, KeywordSqlGenerator, LlmSqlGenerator,
    LlmSummarizer, OutletQueryTool, OutletStore, ProductSearchTool, SqlGenerator, SqliteOutletStore,
    ToolDispatcher, ToolRegistry, ToolTimeouts, VectorIndex,
};

/// 根据配置选择模型后端：openai 需要 OPENAI_API_KEY，否则退回离线启发式后端
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(key.as_str()),
            ))
        }
        ("openai", None) => {
            tracing::warn!("OPENAI_API_KEY not set, using heuristic LLM");
            Arc::new(HeuristicLlmClient)
        }
        _ => {
            tracing::info!("Using heuristic LLM");
            Arc::new(HeuristicLlmClient)
        }
    }
}

pub struct ServiceBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    product_index: Option<Arc<dyn VectorIndex>>,
    outlet_store: Option<Arc<dyn OutletStore>>,
}

impl ServiceBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            product_index: None,
            outlet_store: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_product_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.product_index = Some(index);
        self
    }

    pub fn with_outlet_store(mut self, store: Arc<dyn OutletStore>) -> Self {
        self.outlet_store = Some(store);
        self
    }

    fn tool_timeouts(&self) -> ToolTimeouts {
        let t = &self.config.tools.timeouts;
        ToolTimeouts {
            calc: Duration::from_millis(t.calc_ms),
            products: Duration::from_millis(t.products_ms),
            outlets: Duration::from_millis(t.outlets_ms),
        }
    }

    /// HTTP 计算后端的单次请求超时：两次尝试都要落在 calc 截止时间之内
    fn calc_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.config.tools.timeouts.calc_ms * 2 / 5)
    }

    /// 摘要截止时间严格小于产品检索截止时间，慢摘要只会丢掉摘要
    fn summary_timeout(&self) -> Duration {
        let t = &self.config.tools.timeouts;
        Duration::from_millis(t.summary_ms.min(t.products_ms / 2))
    }

    fn build_embedder(&self) -> Arc<dyn EmbeddingProvider> {
        if let Some(embedder) = &self.embedder {
            return embedder.clone();
        }
        let products = &self.config.tools.products;
        match products.embedding {
            EmbeddingBackend::Openai => Arc::new(OpenAiEmbedder::new(
                self.config.llm.base_url.as_deref(),
                &products.embedding_model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            )),
            EmbeddingBackend::Hash => Arc::new(HashEmbedder::new(products.embedding_dims)),
        }
    }

    async fn build_product_index(
        &self,
        embedder: &dyn EmbeddingProvider,
    ) -> anyhow::Result<Arc<dyn VectorIndex>> {
        if let Some(index) = &self.product_index {
            return Ok(index.clone());
        }
        match &self.config.tools.products.catalog_path {
            Some(path) => {
                let index = InMemoryProductIndex::load_json(path, embedder)
                    .await
                    .with_context(|| format!("Failed to load product catalog {}", path.display()))?;
                tracing::info!("Loaded {} products from {}", index.len(), path.display());
                Ok(Arc::new(index))
            }
            None => {
                tracing::warn!("No product catalog configured, product search returns no hits");
                Ok(Arc::new(InMemoryProductIndex::default()))
            }
        }
    }

    fn build_outlet_store(&self) -> anyhow::Result<Arc<dyn OutletStore>> {
        if let Some(store) = &self.outlet_store {
            return Ok(store.clone());
        }
        let store = match &self.config.tools.outlets.db_path {
            Some(path) => SqliteOutletStore::open(path)
                .with_context(|| format!("Failed to open outlet database {}", path.display()))?,
            None => {
                tracing::warn!("No outlet database configured, using an empty in-memory table");
                SqliteOutletStore::open_in_memory().context("Failed to create in-memory outlet table")?
            }
        };
        Ok(Arc::new(store))
    }

    /// 构建三类工具的注册表
    pub async fn build_tool_registry(&self, llm: Arc<dyn LlmClient>) -> anyhow::Result<ToolRegistry> {
        let tools_cfg = &self.config.tools;
        let timeouts = self.tool_timeouts();
        let mut tools = ToolRegistry::new();

        match tools_cfg.calc_mode {
            CalcMode::Local => tools.register(CalculatorTool::local()),
            CalcMode::Http => {
                let base = tools_cfg.calc_http_base_url.as_deref().unwrap_or_default();
                let backend = HttpCalculator::new(base, self.calc_attempt_timeout())
                    .context("calc_mode = http requires tools.calc_http_base_url")?;
                tools.register(CalculatorTool::new(Arc::new(backend)));
            }
        }

        let embedder = self.build_embedder();
        let index = self.build_product_index(embedder.as_ref()).await?;
        let mut products = ProductSearchTool::new(embedder, index).with_top_k(tools_cfg.products.top_k);
        if tools_cfg.products.summary {
            let summarizer = LlmSummarizer::new(llm.clone(), self.summary_timeout());
            products = products.with_summarizer(Arc::new(summarizer));
        }
        tools.register(products);

        let outlets_cfg = &tools_cfg.outlets;
        let generator: Arc<dyn SqlGenerator> = match outlets_cfg.text2sql {
            Text2SqlMode::Keyword => Arc::new(KeywordSqlGenerator::new(outlets_cfg.sql_limit)),
            Text2SqlMode::Llm => Arc::new(LlmSqlGenerator::new(llm, timeouts.outlets, outlets_cfg.sql_limit)),
        };
        tools.register(
            OutletQueryTool::new(generator, self.build_outlet_store()?).with_max_rows(outlets_cfg.max_rows),
        );

        Ok(tools)
    }

    pub async fn build(self) -> anyhow::Result<ChatService> {
        let llm = self.llm.clone().unwrap_or_else(|| create_llm_from_config(&self.config));
        let tools = self.build_tool_registry(llm.clone()).await?;
        tracing::info!(tools = ?tools.tool_names(), backend = llm.name(), "tools registered");

        let dispatcher = Arc::new(ToolDispatcher::new(tools, self.tool_timeouts()));
        let machine = PlannerStateMachine::new(
            PlannerModel::new(llm, self.config.llm.timeout()),
            dispatcher,
            PlannerConfig {
                max_calls_per_turn: self.config.planner.max_calls_per_turn,
                history_window: self.config.planner.history_window,
            },
        );

        let events_cfg = &self.config.events;
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(events_cfg.session_idle_secs)));
        let events = Arc::new(SessionEventStream::new(
            registry,
            Duration::from_secs(events_cfg.heartbeat_secs.max(1)),
        ));
        Ok(ChatService::new(machine, events, self.config.planner.turn_policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnPolicy;
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{ProductDocument, ToolName};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 第一个连接读完请求后挂起不回，之后的连接正常返回 body
    async fn stalls_first_connection(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        (format!("http://{addr}"), hits)
    }

    #[test]
    fn test_derived_timeouts_fit_inside_tool_deadlines() {
        let mut cfg = AppConfig::default();
        cfg.tools.timeouts.calc_ms = 200;
        cfg.tools.timeouts.products_ms = 100;
        cfg.tools.timeouts.summary_ms = 3_000;
        let builder = ServiceBuilder::new(cfg);
        let timeouts = builder.tool_timeouts();
        assert!(builder.calc_attempt_timeout() * 2 < timeouts.calc);
        assert_eq!(builder.summary_timeout(), Duration::from_millis(50));
        assert!(builder.summary_timeout() < timeouts.products);

        let defaults = ServiceBuilder::new(AppConfig::default());
        assert_eq!(defaults.summary_timeout(), Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn test_http_calc_retry_fits_inside_deadline() {
        let (base, hits) = stalls_first_connection(r#"{"expression":"7+8","result":15}"#).await;
        let mut cfg = AppConfig::default();
        cfg.tools.calc_mode = CalcMode::Http;
        cfg.tools.calc_http_base_url = Some(base);
        cfg.tools.timeouts.calc_ms = 200;
        let builder = ServiceBuilder::new(cfg);
        let tools = builder.build_tool_registry(Arc::new(HeuristicLlmClient)).await.unwrap();
        let dispatcher = ToolDispatcher::new(tools, builder.tool_timeouts());

        let action = dispatcher.execute(ToolName::Calc, json!({"expression": "7+8"}), None).await;
        assert!(action.is_success(), "{action:?}");
        assert_eq!(action.data.unwrap()["result"], 15);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_summary_keeps_product_hits() {
        let embedder = Arc::new(HashEmbedder::default());
        let docs = vec![ProductDocument::new(
            "Double wall stainless steel tumbler",
            json!({"title": "All Day Cup", "price": 55}),
        )];
        let index = InMemoryProductIndex::build(docs, embedder.as_ref()).await.unwrap();
        let llm = ScriptedLlmClient::new([r#"{"summary": "late"}"#]).with_delay(Duration::from_millis(300));

        let mut cfg = AppConfig::default();
        cfg.tools.timeouts.products_ms = 100;
        let builder = ServiceBuilder::new(cfg)
            .with_embedder(embedder)
            .with_product_index(Arc::new(index));
        let tools = builder.build_tool_registry(Arc::new(llm)).await.unwrap();
        let dispatcher = ToolDispatcher::new(tools, builder.tool_timeouts());

        let action = dispatcher.execute(ToolName::Products, json!({"query": "tumbler"}), None).await;
        assert!(action.is_success(), "{action:?}");
        let data = action.data.unwrap();
        assert_eq!(data["topK"][0]["title"], "All Day Cup");
        assert!(data["summary"].is_null());
    }

    #[tokio::test]
    async fn test_default_build_registers_all_tools() {
        let builder = ServiceBuilder::new(AppConfig::default());
        let tools = builder
            .build_tool_registry(Arc::new(HeuristicLlmClient))
            .await
            .unwrap();
        assert_eq!(tools.tool_names().len(), 3);
    }

    #[tokio::test]
    async fn test_http_calc_without_base_url_fails() {
        let mut cfg = AppConfig::default();
        cfg.tools.calc_mode = CalcMode::Http;
        let err = ServiceBuilder::new(cfg).build().await.err().unwrap();
        assert!(err.to_string().contains("calc_http_base_url"));
    }

    #[tokio::test]
    async fn test_missing_catalog_file_fails() {
        let mut cfg = AppConfig::default();
        cfg.tools.products.catalog_path = Some("/nonexistent/products.json".into());
        cfg.planner.turn_policy = TurnPolicy::Reject;
        assert!(ServiceBuilder::new(cfg).build().await.is_err());
    }
}
