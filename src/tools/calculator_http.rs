//! HTTP 计算后端：`GET {base}/calc?query=<expr>`
//!
//! 连接失败或超时最多重试一次；4xx 不重试，错误消息取自响应体 `error.message`。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::ToolError;
use crate::tools::calculator::{Calculation, CalculatorBackend};

#[derive(Debug, Deserialize)]
struct CalcResponse {
    expression: String,
    result: f64,
}

pub struct HttpCalculator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCalculator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ToolError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ToolError::ProviderUnavailable(
                "calculator base url is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::ProviderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    async fn request(&self, expression: &str) -> Result<Calculation, ToolError> {
        let url = format!("{}/calc", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", expression)])
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let payload: Option<Value> = response.json().await.ok();
            let message = payload
                .as_ref()
                .and_then(|p| p.get("error"))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Calculator request failed.")
                .to_string();
            return Err(if status.is_client_error() {
                ToolError::Validation(message)
            } else {
                ToolError::Upstream(message)
            });
        }

        let body: CalcResponse = response.json().await.map_err(|_| {
            ToolError::Upstream("Calculator response was not valid JSON.".to_string())
        })?;
        Ok(Calculation {
            expression: body.expression,
            value: body.result,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        ToolError::UpstreamTimeout("calculator service timed out".to_string())
    } else if err.is_connect() {
        ToolError::ProviderUnavailable("Calculator service is unavailable.".to_string())
    } else {
        ToolError::Upstream(err.to_string())
    }
}

#[async_trait]
impl CalculatorBackend for HttpCalculator {
    async fn evaluate(&self, expression: &str) -> Result<Calculation, ToolError> {
        let query = expression.trim();
        if query.is_empty() {
            return Err(ToolError::Validation("Expression cannot be empty.".to_string()));
        }
        match self.request(query).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "calculator request failed, retrying once");
                self.request(query).await
            }
            other => other,
        }
    }

    fn mode(&self) -> &'static str {
        "http"
    }
}
