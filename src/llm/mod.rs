//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），以及模型输出中的 JSON 提取

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError};

use std::sync::Arc;

use crate::config::AppConfig;

/// 从模型输出中截取 JSON 片段：优先 ```json 代码块，其次首个 '{' 到最后一个 '}'
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(block.trim());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&trimmed[start..=end])
}

/// 按配置创建模型客户端；provider = "mock" 时返回回显客户端（离线调试）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.as_str() {
        "mock" => Arc::new(MockLlmClient::echo()),
        _ => Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            cfg.llm.api_key.as_deref(),
            cfg.llm.timeouts.request,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_fenced() {
        let out = "Here you go:\n```json\n{\"needsPlan\": true}\n```\nthanks";
        assert_eq!(extract_json(out), Some("{\"needsPlan\": true}"));
    }

    #[test]
    fn test_extract_json_bare() {
        let out = "sure {\"tool\": \"list_files\", \"args\": {}} done";
        assert_eq!(extract_json(out), Some("{\"tool\": \"list_files\", \"args\": {}}"));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json("no structured output here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }
}
