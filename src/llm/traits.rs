//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / 离线确定性 / 脚本化测试桩）实现 LlmClient::complete；具体实现在启动时选定一次。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out after {0} ms")]
    Timeout(u64),

    /// 连接失败（网络不可达、拒绝连接）
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),

    /// 服务端返回错误
    #[error("LLM provider error: {0}")]
    Provider(String),

    /// 输出无法解析为期望的结构
    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "upstream_timeout",
            LlmError::Unavailable(_) => "provider_unavailable",
            LlmError::Provider(_) => "model_error",
            LlmError::InvalidResponse(_) => "invalid_model_output",
        }
    }
}

/// LLM 客户端 trait：prompt（消息列表）-> 文本
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 后端名称（写入日志）
    fn name(&self) -> &str {
        "llm"
    }
}
