//! ToolAgent：模型驱动的工具循环
//!
//! 每轮：压缩上下文 → 调用模型 → 解析为 JSON 工具调用或直接回复 → 网关授权（危险操作走审批）
//! → 修改类操作在资源锁内执行 → 结果以 Tool 消息回流。直接回复或达到单轮工具上限时结束。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::{Agent, AgentOutput, AgentRequest, StepContext};
use crate::core::AgentError;
use crate::gateway::{allowed_tools, CapabilityGateway};
use crate::llm::{extract_json, LlmClient};
use crate::memory::{MemoryManager, Message};
use crate::planning::AgentType;
use crate::queue::StreamEvent;
use crate::store::ResourceLock;
use crate::tools::{ToolExecutor, ToolResult};

/// 连续多少次无法解析后放弃纠正，把原文当作回复
const MAX_PARSE_RETRIES: usize = 2;

const PREVIEW_CHARS: usize = 200;

/// 模型给出的工具调用：{"tool": "list_files", "args": {"folderId": "..."}}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone)]
pub enum AgentReply {
    Response(String),
    ToolCall(ToolCall),
}

/// 解析模型输出：有效 JSON 且 tool 非空为工具调用，纯文本为回复；
/// 明显想输出 JSON 却解析失败时返回 JsonParseError，由调用方要求模型重写
pub fn parse_llm_output(output: &str) -> Result<AgentReply, AgentError> {
    let trimmed = output.trim();
    let Some(json) = extract_json(trimmed) else {
        return Ok(AgentReply::Response(trimmed.to_string()));
    };
    match serde_json::from_str::<ToolCall>(json) {
        Ok(call) if !call.tool.trim().is_empty() => Ok(AgentReply::ToolCall(call)),
        Ok(_) => Ok(AgentReply::Response(trimmed.to_string())),
        Err(e) => {
            if trimmed.starts_with('{') || trimmed.contains("```json") {
                Err(AgentError::JsonParseError(format!("{}: {}", e, json)))
            } else {
                Ok(AgentReply::Response(trimmed.to_string()))
            }
        }
    }
}

/// 所有 ToolAgent 共享的依赖
#[derive(Clone)]
pub struct AgentDeps {
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<ToolExecutor>,
    pub gateway: Arc<CapabilityGateway>,
    pub locks: ResourceLock,
    pub memory: Arc<MemoryManager>,
    pub max_tool_calls: usize,
}

fn role_description(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::File => "You manage files and folders: listing, creating, renaming, moving, trashing, restoring, deleting and starring.",
        AgentType::Document => "You read and edit the content of documents.",
        AgentType::Search => "You find files by keyword or meaning and keep the search index up to date.",
        AgentType::General => "You answer questions, summarize results from earlier steps and explain what was done. You may only read.",
    }
}

pub struct ToolAgent {
    agent_type: AgentType,
    deps: AgentDeps,
    system_prompt: String,
}

impl ToolAgent {
    pub fn new(agent_type: AgentType, deps: AgentDeps) -> Self {
        let tools = deps
            .executor
            .registry()
            .describe_subset(allowed_tools(agent_type));
        let system_prompt = format!(
            "You are the {agent_type} agent of a cloud-drive assistant. {}\n\n\
             Available tools:\n{tools}\n\n\
             To call a tool, reply with JSON only: {{\"tool\": \"<name>\", \"args\": {{...}}}}. \
             Call one tool per reply. Tool results come back as tool messages. \
             When you have everything you need, reply in plain text without JSON.",
            role_description(agent_type)
        );
        Self {
            agent_type,
            deps,
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    async fn invoke_tool(&self, call: ToolCall, ctx: &StepContext) -> Result<ToolResult, AgentError> {
        let tool = call.tool;
        let args = if call.args.is_null() {
            serde_json::json!({})
        } else {
            call.args
        };
        ctx.events.emit(StreamEvent::ToolCallStart {
            step_id: ctx.step_id,
            tool: tool.clone(),
            args: args.clone(),
        });

        let decision = self
            .deps
            .gateway
            .check_tool_permission(self.agent_type, &tool, &ctx.user_id, &ctx.conversation_id, &args)
            .await?;

        let result = if decision.requires_approval {
            let approval_id = decision.approval_id.clone().unwrap_or_default();
            ctx.events.emit(StreamEvent::ApprovalNeeded {
                approval_id: approval_id.clone(),
                tool: tool.clone(),
                args: args.clone(),
                reason: decision.reason.clone().unwrap_or_default(),
            });
            let outcome = self
                .deps
                .gateway
                .wait_for_approval(&approval_id, &ctx.cancel)
                .await?;
            ctx.events.emit(StreamEvent::ApprovalResolved {
                approval_id,
                approved: outcome.approved,
                status: outcome.status,
            });
            if outcome.approved {
                let args = outcome.modified_args.unwrap_or(args);
                self.execute_guarded(&tool, args, ctx).await?
            } else {
                ToolResult::error(
                    &tool,
                    format!(
                        "The user did not approve {tool} (approval {:?}). Do not retry it.",
                        outcome.status
                    ),
                )
            }
        } else if !decision.allowed {
            ToolResult::error(&tool, decision.reason.unwrap_or_else(|| "Not allowed".to_string()))
        } else {
            self.execute_guarded(&tool, args, ctx).await?
        };

        ctx.events.emit(StreamEvent::ToolCallEnd {
            step_id: ctx.step_id,
            tool: tool.clone(),
            is_error: result.is_error,
            preview: result.content.chars().take(PREVIEW_CHARS).collect(),
        });
        Ok(result)
    }

    /// 注入调用者身份后执行；修改类操作持有资源锁
    async fn execute_guarded(
        &self,
        tool: &str,
        mut args: Value,
        ctx: &StepContext,
    ) -> Result<ToolResult, AgentError> {
        if let Some(obj) = args.as_object_mut() {
            obj.insert("userId".to_string(), Value::String(ctx.user_id.clone()));
        }
        if !self.deps.executor.is_mutating(tool) {
            return Ok(self.deps.executor.run(tool, args).await);
        }

        let resource = resource_id(&args, &ctx.user_id);
        let Some(guard) = self.deps.locks.acquire(&resource).await? else {
            return Ok(ToolResult::error(
                tool,
                format!("Resource {resource} is busy with another operation; try again later."),
            ));
        };
        let result = self.deps.executor.run(tool, args).await;
        if let Err(e) = guard.release().await {
            tracing::warn!(resource = %resource, "Failed to release resource lock: {}", e);
        }
        Ok(result)
    }
}

/// 修改类操作的锁粒度：目标文件/文件夹/文档 id，没有时退化为用户级
fn resource_id(args: &Value, user_id: &str) -> String {
    ["fileId", "folderId", "documentId", "id"]
        .iter()
        .find_map(|key| args.get(*key).and_then(|v| v.as_str()))
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("user:{user_id}"))
}

#[async_trait]
impl Agent for ToolAgent {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        let AgentRequest { messages: history, ctx } = request;
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend(history);

        let mut tool_results = Vec::new();
        let mut parse_failures = 0;

        loop {
            let prompt = self.deps.memory.compress_if_needed(messages.clone());
            let output = self.deps.llm.complete(&prompt).await?;

            match parse_llm_output(&output) {
                Ok(AgentReply::Response(content)) => {
                    return Ok(AgentOutput {
                        content,
                        tool_results,
                    });
                }
                Ok(AgentReply::ToolCall(call)) => {
                    parse_failures = 0;
                    if tool_results.len() >= self.deps.max_tool_calls {
                        tracing::warn!(
                            agent = %self.agent_type,
                            limit = self.deps.max_tool_calls,
                            "tool call ceiling reached"
                        );
                        return Ok(AgentOutput {
                            content: format!(
                                "Stopped after {} tool calls without a final answer.",
                                tool_results.len()
                            ),
                            tool_results,
                        });
                    }
                    tracing::debug!(agent = %self.agent_type, tool = %call.tool, "tool call");
                    let result = self.invoke_tool(call, &ctx).await?;
                    messages.push(Message::assistant(output));
                    messages.push(Message::tool(format!(
                        "[{}] {}{}",
                        result.tool,
                        if result.is_error { "ERROR: " } else { "" },
                        result.content
                    )));
                    tool_results.push(result);
                }
                Err(AgentError::JsonParseError(e)) => {
                    parse_failures += 1;
                    if parse_failures > MAX_PARSE_RETRIES {
                        tracing::warn!(agent = %self.agent_type, "giving up on malformed tool call");
                        return Ok(AgentOutput {
                            content: output,
                            tool_results,
                        });
                    }
                    messages.push(Message::assistant(output));
                    messages.push(Message::user(format!(
                        "Your last reply was not valid JSON ({e}). Reply with a single JSON tool call or plain text."
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
