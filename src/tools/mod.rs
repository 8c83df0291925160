//! 工具层：计算器、产品检索（RAG）、门店查询（text2sql + 安全闸门），以及统一调度
pub mod action;
pub mod calculator;
pub mod calculator_http;
pub mod dispatcher;
pub mod outlet_store;
pub mod outlets;
pub mod products;
pub mod registry;
pub mod sql_gate;
pub mod text2sql;
pub mod vector;

pub use action::{ActionKind, ActionStatus, ToolAction, ToolName};
pub use calculator::{CalculatorBackend, CalculatorTool, LocalCalculator};
pub use calculator_http::HttpCalculator;
pub use dispatcher::{ToolDispatcher, ToolTimeouts};
pub use outlet_store::{OutletRecord, OutletStore, SqliteOutletStore};
pub use outlets::OutletQueryTool;
pub use products::{LlmSummarizer, ProductSearchTool, ProductSummarizer, TemplateSummarizer};
pub use registry::{Tool, ToolOutput, ToolRegistry};
pub use sql_gate::{SqlCandidate, SqlSafetyGate};
pub use text2sql::{KeywordSqlGenerator, LlmSqlGenerator, SqlGenerator};
pub use vector::{InMemoryProductIndex, ProductDocument, VectorIndex};
