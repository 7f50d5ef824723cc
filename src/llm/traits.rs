//! LLM 客户端抽象
//!
//! 编排引擎把模型当作不透明的请求/响应函数：给定消息列表，返回一段文本。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 与模型提供方通信失败（唯一会结束本轮的硬错误）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 提供方返回非成功状态
    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
