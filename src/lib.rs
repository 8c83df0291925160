//! chat-planner - 对话规划编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 调用预算、会话注册表、SSE 事件流、对话服务与组装
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 离线启发式 / 脚本化）及嵌入
//! - **memory**: 对话消息与会话状态
//! - **observability**: 日志初始化
//! - **planner**: 意图 -> 槽位 -> 决策 -> 工具 -> 追问/合成 的状态机
//! - **tools**: 计算器、产品检索、门店查询（SQL 安全闸门）与调度器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod tools;
