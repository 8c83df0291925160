//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CHAT__*` 覆盖（双下划线表示嵌套，如 `CHAT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub planner: PlannerSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub events: EventsSection,
    pub web: WebSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// 同一会话已有轮次在执行时的处理方式
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnPolicy {
    /// 排队等待前一轮结束
    #[default]
    Queue,
    /// 直接返回 SessionBusy
    Reject,
}

/// [planner] 段：单轮调用预算、并发轮次策略、提示词历史窗口
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    #[serde(default = "default_max_calls_per_turn")]
    pub max_calls_per_turn: usize,
    #[serde(default)]
    pub turn_policy: TurnPolicy,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_calls_per_turn: default_max_calls_per_turn(),
            turn_policy: TurnPolicy::default(),
            history_window: default_history_window(),
        }
    }
}

fn default_max_calls_per_turn() -> usize {
    6
}

fn default_history_window() -> usize {
    6
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock（离线启发式）/ openai（OpenAI 兼容端点，需要 OPENAI_API_KEY）
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    20
}

impl LlmSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// 计算器运行方式
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CalcMode {
    #[default]
    Local,
    Http,
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    pub calc_mode: CalcMode,
    /// calc_mode = http 时的服务地址（GET {base}/calc?query=）
    pub calc_http_base_url: Option<String>,
    pub timeouts: ToolTimeoutsSection,
    pub products: ProductsSection,
    pub outlets: OutletsSection,
}

/// [tools.timeouts] 段：各工具的截止时间（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct ToolTimeoutsSection {
    #[serde(default = "default_calc_timeout_ms")]
    pub calc_ms: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub products_ms: u64,
    #[serde(default = "default_lookup_timeout_ms")]
    pub outlets_ms: u64,
    /// 产品摘要的截止时间；实际取值不超过 products_ms 的一半，摘要超时只丢弃摘要
    #[serde(default = "default_summary_timeout_ms")]
    pub summary_ms: u64,
}

impl Default for ToolTimeoutsSection {
    fn default() -> Self {
        Self {
            calc_ms: default_calc_timeout_ms(),
            products_ms: default_lookup_timeout_ms(),
            outlets_ms: default_lookup_timeout_ms(),
            summary_ms: default_summary_timeout_ms(),
        }
    }
}

fn default_calc_timeout_ms() -> u64 {
    5_000
}

fn default_lookup_timeout_ms() -> u64 {
    8_000
}

fn default_summary_timeout_ms() -> u64 {
    3_000
}

/// 嵌入后端
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Hash,
    Openai,
}

/// [tools.products] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ProductsSection {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 是否调用模型生成摘要
    #[serde(default = "default_true")]
    pub summary: bool,
    /// 产品目录 JSON（数组，元素含 content/metadata）
    pub catalog_path: Option<PathBuf>,
    #[serde(default)]
    pub embedding: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
}

impl Default for ProductsSection {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            summary: true,
            catalog_path: None,
            embedding: EmbeddingBackend::default(),
            embedding_model: default_embedding_model(),
            embedding_dims: default_embedding_dims(),
        }
    }
}

fn default_top_k() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dims() -> usize {
    256
}

/// 门店 SQL 的生成方式
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Text2SqlMode {
    /// 关键词规则
    #[default]
    Keyword,
    /// 模型生成（字面量会被提升为绑定参数）
    Llm,
}

/// [tools.outlets] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OutletsSection {
    /// SQLite 文件；未设置时使用内存库（空表）
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default)]
    pub text2sql: Text2SqlMode,
    #[serde(default = "default_sql_limit")]
    pub sql_limit: usize,
}

impl Default for OutletsSection {
    fn default() -> Self {
        Self {
            db_path: None,
            max_rows: default_max_rows(),
            text2sql: Text2SqlMode::default(),
            sql_limit: default_sql_limit(),
        }
    }
}

fn default_max_rows() -> usize {
    20
}

fn default_sql_limit() -> usize {
    10
}

/// [events] 段：SSE 心跳与会话回收
#[derive(Debug, Clone, Deserialize)]
pub struct EventsSection {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            session_idle_secs: default_session_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_session_idle_secs() -> u64 {
    1_800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 {
    8000
}

/// 从 config 目录加载配置，环境变量 CHAT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CHAT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CHAT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
