//! 单步请求的 Agent 路由
//!
//! 先用关键词规则快速匹配（不调用模型），匹配不到再让模型在封闭集合中选择；都失败时用默认 Agent。

use std::sync::Arc;

use crate::llm::{extract_json, LlmClient};
use crate::memory::Message;
use crate::planning::AgentType;

const SEARCH_KEYWORDS: &[&str] = &["search", "find ", "look for", "搜索", "查找", "找一下"];

const DOCUMENT_KEYWORDS: &[&str] = &[
    "document", " doc ", "edit ", "rewrite", "patch", "content of", "文档", "编辑", "改写",
];

const FILE_KEYWORDS: &[&str] = &[
    "delete", "remove", "rename", "move ", "trash", "restore", "star", "folder", "list ",
    "create ", "删除", "重命名", "移动", "回收站", "恢复", "收藏", "文件夹", "列出", "新建",
];

const ROUTE_PROMPT: &str = "Pick the agent that should handle a cloud-drive assistant request. \
Agents: \"file\" (file and folder management), \"document\" (reading or editing document content), \
\"search\" (finding files), \"general\" (questions and conversation). \
Answer with JSON only: {\"agent\": \"<name>\"}.";

pub struct AgentRouter {
    llm: Arc<dyn LlmClient>,
    default_agent: AgentType,
}

impl AgentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, default_agent: AgentType) -> Self {
        Self { llm, default_agent }
    }

    /// 关键词规则；按 search → document → file 的顺序
    pub fn fast_match(&self, message: &str) -> Option<AgentType> {
        let lower = format!(" {} ", message.to_lowercase());
        let hit = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));
        if hit(SEARCH_KEYWORDS) {
            Some(AgentType::Search)
        } else if hit(DOCUMENT_KEYWORDS) {
            Some(AgentType::Document)
        } else if hit(FILE_KEYWORDS) {
            Some(AgentType::File)
        } else {
            None
        }
    }

    pub async fn route(&self, message: &str) -> AgentType {
        if let Some(agent) = self.fast_match(message) {
            return agent;
        }
        let request = [Message::system(ROUTE_PROMPT), Message::user(message)];
        match self.llm.complete(&request).await {
            Ok(answer) => extract_json(&answer)
                .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
                .and_then(|v| v.get("agent").and_then(|a| a.as_str()).map(str::to_string))
                .and_then(|name| name.parse::<AgentType>().ok())
                .unwrap_or(self.default_agent),
            Err(e) => {
                tracing::warn!("Agent routing failed, using default agent: {}", e);
                self.default_agent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn router(llm: MockLlmClient) -> AgentRouter {
        AgentRouter::new(Arc::new(llm), AgentType::General)
    }

    #[test]
    fn test_fast_match() {
        let r = router(MockLlmClient::echo());
        assert_eq!(r.fast_match("search my files for budget"), Some(AgentType::Search));
        assert_eq!(r.fast_match("Edit the Q3 report document"), Some(AgentType::Document));
        assert_eq!(r.fast_match("delete the folder Old Stuff"), Some(AgentType::File));
        assert_eq!(r.fast_match("list my files"), Some(AgentType::File));
        assert_eq!(r.fast_match("删除文件夹 旧报告"), Some(AgentType::File));
        assert_eq!(r.fast_match("how are you today?"), None);
    }

    #[tokio::test]
    async fn test_model_choice_and_fallback() {
        let r = router(MockLlmClient::scripted(vec![
            Ok("{\"agent\": \"document\"}".into()),
            Ok("{\"agent\": \"calendar\"}".into()),
        ]));
        assert_eq!(r.route("what does my thesis say about bees").await, AgentType::Document);
        assert_eq!(r.route("what is on my plate").await, AgentType::General);
        // 脚本耗尽，模型报错
        assert_eq!(r.route("what now").await, AgentType::General);
    }
}
