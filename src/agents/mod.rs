//! 专职 Agent：统一的 Agent trait、按 AgentType 查表的注册表、基于工具循环的 ToolAgent

pub mod router;
pub mod tool_agent;

pub use router::AgentRouter;
pub use tool_agent::{parse_llm_output, AgentDeps, AgentReply, ToolAgent, ToolCall};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::memory::Message;
use crate::planning::AgentType;
use crate::queue::EventSink;
use crate::tools::ToolResult;

/// 一次 Agent 调用的上下文
#[derive(Clone)]
pub struct StepContext {
    pub user_id: String,
    pub conversation_id: String,
    /// 单步直达执行时为 None
    pub step_id: Option<u32>,
    pub events: EventSink,
    /// 只作用于审批等待
    pub cancel: CancellationToken,
}

pub struct AgentRequest {
    pub messages: Vec<Message>,
    pub ctx: StepContext,
}

#[derive(Clone, Debug, Default)]
pub struct AgentOutput {
    pub content: String,
    pub tool_results: Vec<ToolResult>,
}

impl AgentOutput {
    /// 调用过工具且全部出错
    pub fn only_errors(&self) -> bool {
        !self.tool_results.is_empty() && self.tool_results.iter().all(|r| r.is_error)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.tool_results
            .iter()
            .rev()
            .find(|r| r.is_error)
            .map(|r| r.content.as_str())
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> AgentType;

    async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError>;
}

/// AgentType → 实现 的查找表
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<AgentType, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为每种 AgentType 注册一个 ToolAgent
    pub fn with_tool_agents(deps: AgentDeps) -> Self {
        let mut registry = Self::new();
        for agent_type in AgentType::ALL {
            registry.register(Arc::new(ToolAgent::new(agent_type, deps.clone())));
        }
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.agent_type(), agent);
    }

    pub fn get(&self, agent_type: AgentType) -> Option<Arc<dyn Agent>> {
        self.agents.get(&agent_type).cloned()
    }

    pub fn contains(&self, agent_type: AgentType) -> bool {
        self.agents.contains_key(&agent_type)
    }
}
