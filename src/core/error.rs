//! 错误类型
//!
//! 工具层错误（ToolError）在 ToolDispatcher 边界被转换为 status=error 的 ToolAction，
//! 不会越过规划器；请求层错误（PlannerError）只在进入规划器之前返回给调用方。

use thiserror::Error;

/// 工具调用失败的分类
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    /// 参数缺失或格式不合法：给用户提示，不执行
    #[error("Validation error: {0}")]
    Validation(String),

    /// 协作方超过截止时间
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// SQL 安全闸门拒绝；内容仅进入内部遥测，不返回给用户
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    /// 连接失败（区别于上游返回的 5xx）
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// 上游已响应但返回应用级错误
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ToolError {
    /// 错误类型标识（写入事件与 ToolAction.data）
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation_error",
            ToolError::UpstreamTimeout(_) => "upstream_timeout",
            ToolError::SafetyViolation(_) => "safety_violation",
            ToolError::ProviderUnavailable(_) => "provider_unavailable",
            ToolError::Upstream(_) => "upstream_error",
        }
    }

    /// 面向用户的消息；SafetyViolation 只给出通用拒绝，不泄露具体违规项
    pub fn user_message(&self) -> String {
        match self {
            ToolError::Validation(msg) => msg.clone(),
            ToolError::UpstreamTimeout(_) => {
                "The service took too long to respond.".to_string()
            }
            ToolError::SafetyViolation(_) => {
                "I can't run that lookup. Please rephrase your outlet question.".to_string()
            }
            ToolError::ProviderUnavailable(_) => {
                "The service is temporarily unavailable. Please try again shortly.".to_string()
            }
            ToolError::Upstream(msg) => msg.clone(),
        }
    }

    /// 是否为可重试的瞬时故障（只读幂等调用最多重试一次）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::UpstreamTimeout(_) | ToolError::ProviderUnavailable(_)
        )
    }
}

/// 请求层错误：轮次未开始前即可判定
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 同一会话已有轮次在执行（turn_policy = reject）
    #[error("Session busy: {0}")]
    SessionBusy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_violation_hides_detail() {
        let err = ToolError::SafetyViolation("forbidden keyword DROP".to_string());
        let msg = err.user_message();
        assert!(!msg.contains("DROP"));
        assert_eq!(err.kind(), "safety_violation");
    }

    #[test]
    fn test_transient_errors() {
        assert!(ToolError::UpstreamTimeout("calc".into()).is_transient());
        assert!(ToolError::ProviderUnavailable("calc".into()).is_transient());
        assert!(!ToolError::Validation("bad".into()).is_transient());
        assert!(!ToolError::Upstream("500".into()).is_transient());
    }

    #[test]
    fn test_provider_unavailable_asks_to_retry() {
        let err = ToolError::ProviderUnavailable("connection refused".into());
        assert!(err.user_message().contains("try again shortly"));
    }
}
