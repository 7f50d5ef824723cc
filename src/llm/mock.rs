//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 三种模式：回显最后一条 User 消息、按顺序返回脚本化回复、按闭包根据消息内容生成回复。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

type Responder = Box<dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync>;

enum Mode {
    Echo,
    Scripted(Mutex<VecDeque<Result<String, LlmError>>>),
    Responder(Responder),
}

/// Mock 客户端
pub struct MockLlmClient {
    mode: Mode,
    calls: AtomicUsize,
}

impl MockLlmClient {
    /// 回显最后一条用户消息
    pub fn echo() -> Self {
        Self {
            mode: Mode::Echo,
            calls: AtomicUsize::new(0),
        }
    }

    /// 依次返回给定回复；耗尽后返回 Request 错误
    pub fn scripted(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            mode: Mode::Scripted(Mutex::new(replies.into())),
            calls: AtomicUsize::new(0),
        }
    }

    /// 根据完整消息列表生成回复，适合并发调用顺序不确定的场景
    pub fn from_fn(
        f: impl Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            mode: Mode::Responder(Box::new(f)),
            calls: AtomicUsize::new(0),
        }
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            Mode::Echo => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!("Echo from Mock: {last_user}"))
            }
            Mode::Scripted(queue) => queue
                .lock()
                .map_err(|_| LlmError::Request("mock script poisoned".into()))?
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Request("mock script exhausted".into()))),
            Mode::Responder(f) => f(messages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let llm = MockLlmClient::scripted(vec![Ok("one".into()), Ok("two".into())]);
        let msgs = vec![Message::user("hi")];
        assert_eq!(llm.complete(&msgs).await.unwrap(), "one");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "two");
        assert!(llm.complete(&msgs).await.is_err());
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_echo_uses_last_user_message() {
        let llm = MockLlmClient::echo();
        let msgs = vec![Message::user("first"), Message::assistant("ok"), Message::user("second")];
        assert_eq!(llm.complete(&msgs).await.unwrap(), "Echo from Mock: second");
    }
}
