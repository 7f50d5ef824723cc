//! Agent 错误类型
//!
//! 只有模型传输失败（LlmError）会作为硬错误终止本轮；工具失败、网关拒绝、审批超时都以数据形式回流给 Agent。

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// 编排、Agent、队列处理过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 模型提供方返回非成功响应或请求失败（硬错误，结束本轮）
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 模型调用了注册表中不存在的工具
    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("No agent registered for type: {0}")]
    AgentNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 是否为必须终止本轮的硬错误（目前仅模型传输失败）
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Llm(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_llm_errors_are_fatal() {
        let err = AgentError::Llm(LlmError::Http {
            status: 502,
            body: "bad gateway".into(),
        });
        assert!(err.is_fatal());
        assert!(!AgentError::ToolTimeout("delete_file".into()).is_fatal());
        assert!(!AgentError::HallucinatedTool("format_disk".into()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = AgentError::AgentNotFound("document".into());
        assert_eq!(err.to_string(), "No agent registered for type: document");
    }
}
