//! 记忆管理：把无界的会话历史压缩为有界上下文（摘要 + 滑动窗口）
//!
//! - build_memory_state：超过阈值后，对窗口之前尚未覆盖的区间做一次模型摘要，摘要区间首尾相接
//! - assemble_llm_messages：system → 摘要段 → 未完成计划段 → 窗口原文，顺序固定
//! - compress_if_needed：每次模型调用前的字符预算兜底

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MemorySection;
use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};
use crate::planning::{TaskPlan, TaskPlanTracker};

/// 摘要中单条消息的最大字符数（避免摘要请求本身超长）
const SUMMARY_INPUT_MAX_CHARS: usize = 1_500;

const SUMMARY_PROMPT: &str = "You compress chat history for a cloud-drive assistant. \
Summarize the conversation segment below in at most 8 short bullet points. \
Keep file names, folder names, ids, decisions and unfinished requests. \
Reply with the bullet points only.";

/// 半开区间 [from, to)，索引指向原始消息日志
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRange {
    pub from: usize,
    pub to: usize,
}

/// 一段历史的摘要
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub summary: String,
    pub message_range: MessageRange,
    /// 毫秒时间戳
    pub created_at: i64,
}

/// 单次 Agent 调用所需的记忆视图
#[derive(Clone, Debug, Default)]
pub struct MemoryState {
    pub summaries: Vec<ConversationSummary>,
    pub recent_messages: Vec<Message>,
    pub active_plan: Option<TaskPlan>,
    /// recent_messages 在原始日志中的起始下标
    pub window_start: usize,
}

/// 记忆管理器
pub struct MemoryManager {
    llm: Arc<dyn LlmClient>,
    config: MemorySection,
}

impl MemoryManager {
    pub fn new(llm: Arc<dyn LlmClient>, config: MemorySection) -> Self {
        Self { llm, config }
    }

    pub fn config(&self) -> &MemorySection {
        &self.config
    }

    /// 构建记忆视图；返回的 summaries 包含 prior 以及本次新增的摘要（最多一条）
    pub async fn build_memory_state(
        &self,
        messages: &[Message],
        prior_summaries: &[ConversationSummary],
        active_plan: Option<&TaskPlan>,
    ) -> MemoryState {
        let covered = prior_summaries
            .last()
            .map(|s| s.message_range.to)
            .unwrap_or(0)
            .min(messages.len());
        let mut summaries = prior_summaries.to_vec();
        let mut window_start = covered;

        if messages.len() > self.config.summary_threshold {
            let split = messages.len().saturating_sub(self.config.sliding_window_size);
            if covered < split {
                match self.summarize(&messages[covered..split]).await {
                    Ok(summary) => {
                        tracing::debug!(from = covered, to = split, "conversation segment summarized");
                        summaries.push(ConversationSummary {
                            summary,
                            message_range: MessageRange {
                                from: covered,
                                to: split,
                            },
                            created_at: chrono::Utc::now().timestamp_millis(),
                        });
                        window_start = split;
                    }
                    Err(e) => {
                        // 摘要失败时保留未覆盖的原文，交给 compress_if_needed 兜底
                        tracing::warn!("Conversation summary failed, keeping raw history: {}", e);
                    }
                }
            }
        }

        MemoryState {
            summaries,
            recent_messages: messages[window_start..].to_vec(),
            active_plan: active_plan.cloned(),
            window_start,
        }
    }

    async fn summarize(&self, segment: &[Message]) -> Result<String, LlmError> {
        let transcript = segment
            .iter()
            .map(|m| {
                let content: String = m.content.chars().take(SUMMARY_INPUT_MAX_CHARS).collect();
                format!("{}: {}", role_label(m.role), content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let request = vec![Message::system(SUMMARY_PROMPT), Message::user(transcript)];
        let summary = self.llm.complete(&request).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(LlmError::Request("empty summary".into()));
        }
        Ok(summary.to_string())
    }

    /// 拼装发送给模型的消息：system、摘要段、未完成计划段、窗口原文
    pub fn assemble_llm_messages(system_prompt: &str, state: &MemoryState) -> Vec<Message> {
        let mut out = vec![Message::system(system_prompt)];

        if !state.summaries.is_empty() {
            let mut block = String::from("## Earlier conversation (summarized)\n");
            for s in &state.summaries {
                block.push_str(&format!(
                    "[messages {}-{}]\n{}\n",
                    s.message_range.from, s.message_range.to, s.summary
                ));
            }
            out.push(Message::system(block));
        }

        if let Some(plan) = state.active_plan.as_ref().filter(|p| !p.is_complete) {
            out.push(Message::system(format!(
                "## Active plan\n{}",
                TaskPlanTracker::render_progress(plan)
            )));
        }

        out.extend(state.recent_messages.iter().cloned());
        out
    }

    /// 字符预算兜底：先把超长的工具结果替换为标记，再从最旧的非 system 消息开始逐条淘汰；
    /// 最新的 keep_recent 条消息永远不动，预算满足即停止。
    pub fn compress_if_needed(&self, mut messages: Vec<Message>) -> Vec<Message> {
        let budget = self.config.max_context_chars;
        let mut size = total_chars(&messages);
        if size <= budget {
            return messages;
        }

        let protected_from = messages.len().saturating_sub(self.config.keep_recent);
        for m in messages[..protected_from].iter_mut() {
            let len = m.content.chars().count();
            if m.role == Role::Tool && len > self.config.tool_result_max_chars {
                m.content = format!("[tool result omitted: {len} chars]");
            }
        }
        size = total_chars(&messages);

        while size > budget {
            let protected_from = messages.len().saturating_sub(self.config.keep_recent);
            let Some(pos) = messages[..protected_from]
                .iter()
                .position(|m| m.role != Role::System)
            else {
                break;
            };
            let removed = messages.remove(pos);
            size -= removed.content.chars().count();
        }

        if size > budget {
            tracing::warn!(size, budget, "context still over budget after compression");
        }
        messages
    }
}

fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.content.chars().count()).sum()
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::System => "System",
        Role::Tool => "Tool",
    }
}
