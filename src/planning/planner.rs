//! TaskPlanner：判断请求是否需要拆解，并生成带依赖的多步计划
//!
//! 判断顺序：过短消息 / 单动作模板 → 不规划；多步线索达到阈值 → 规划；否则询问模型（JSON 约束回答）。
//! 模型的任何异常输出都倾向于"不规划"，不阻塞用户。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;

use crate::config::PlannerSection;
use crate::llm::{extract_json, LlmClient};
use crate::memory::Message;
use crate::planning::{AgentType, TaskPlan, TaskStep};

/// 多步线索：顺序词、批量/量词、条件结构（中英文）
const CUE_PATTERNS: &[&str] = &[
    // 顺序
    r"(?i)\bfirst(ly)?\b",
    r"(?i)\bthen\b",
    r"(?i)\bafter(wards)?\b",
    r"(?i)\bnext\b",
    r"(?i)\bfinally\b",
    r"(?i)\band also\b",
    r"首先|然后|接着|之后|最后|再把",
    // 批量
    r"(?i)\b(all|every|each)\b",
    r"(?i)\b(batch|multiple|several)\b",
    r"所有|每个|批量|全部",
    // 条件
    r"(?i)\b(if|unless|otherwise)\b",
    r"如果|否则|假如",
];

/// 明显的单动作请求（且不含任何多步线索时才生效）
const SINGLE_ACTION_PATTERNS: &[&str] = &[
    r"(?i)^\s*(hi|hello|hey|thanks|thank you|ok|okay)\b",
    r"^\s*(你好|谢谢|好的)",
    r"(?i)^\s*(please\s+)?(list|show|open|read|rename|move|delete|trash|restore|star|unstar|search|find)\s+[^,;\n]+$",
    r"^\s*(请)?(列出|打开|查看|重命名|移动|删除|恢复|收藏|搜索)[^，；\n]+$",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("invalid planner pattern {}: {}", p, e);
                None
            }
        })
        .collect()
}

fn cue_patterns() -> &'static [Regex] {
    static CUES: OnceLock<Vec<Regex>> = OnceLock::new();
    CUES.get_or_init(|| compile(CUE_PATTERNS))
}

fn single_action_patterns() -> &'static [Regex] {
    static SINGLE: OnceLock<Vec<Regex>> = OnceLock::new();
    SINGLE.get_or_init(|| compile(SINGLE_ACTION_PATTERNS))
}

/// 消息命中的多步线索条数（每条模式最多计一次）
pub fn count_cues(message: &str) -> usize {
    cue_patterns().iter().filter(|re| re.is_match(message)).count()
}

const CLASSIFY_PROMPT: &str = "You decide whether a cloud-drive assistant request needs a multi-step plan. \
A request needs a plan when it involves several dependent operations, batches, or conditions. \
Answer with JSON only: {\"needsPlan\": true} or {\"needsPlan\": false}.";

const PLAN_PROMPT: &str = r#"You break a cloud-drive assistant request into a minimal execution plan.
Use as few steps as possible (ideally 2-4, never more than 6).
Each step is handled by one agent:
- "file": list/create/rename/move/trash/restore/delete/star files and folders
- "document": read, patch or write document content
- "search": keyword search, semantic search, indexing
- "general": answering, summarizing, explaining
Declare dependencies by step id; independent steps must have empty dependencies so they can run in parallel.
Reply with JSON only:
{"goal": "...", "steps": [{"id": 1, "title": "...", "description": "...", "agentType": "search", "dependencies": []}]}"#;

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    dependencies: Option<Vec<serde_json::Value>>,
}

/// 任务规划器
pub struct TaskPlanner {
    llm: Arc<dyn LlmClient>,
    config: PlannerSection,
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, config: PlannerSection) -> Self {
        Self { llm, config }
    }

    /// 确定性快速判断；无法判断时返回 None
    pub fn quick_decision(&self, message: &str) -> Option<bool> {
        let trimmed = message.trim();
        if trimmed.chars().count() < self.config.min_message_chars {
            return Some(false);
        }
        let cues = count_cues(trimmed);
        if cues == 0 && single_action_patterns().iter().any(|re| re.is_match(trimmed)) {
            return Some(false);
        }
        if cues >= self.config.cue_threshold {
            return Some(true);
        }
        None
    }

    /// 是否需要拆解为多步计划
    pub async fn should_plan_task(&self, message: &str, context_hint: Option<&str>) -> bool {
        if let Some(decision) = self.quick_decision(message) {
            tracing::debug!(decision, "planner quick decision");
            return decision;
        }

        let mut request = vec![Message::system(CLASSIFY_PROMPT)];
        if let Some(hint) = context_hint.filter(|h| !h.trim().is_empty()) {
            request.push(Message::system(format!("Conversation context:\n{hint}")));
        }
        request.push(Message::user(message));

        let answer = match self.llm.complete(&request).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Planner classification failed, not planning: {}", e);
                return false;
            }
        };
        let decision = extract_json(&answer)
            .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
            .and_then(|v| v.get("needsPlan").and_then(|b| b.as_bool()));
        match decision {
            Some(d) => d,
            None => {
                tracing::warn!("Planner classification unparsable, not planning: {}", answer);
                false
            }
        }
    }

    /// 生成计划；模型失败、输出无法解析或没有有效步骤时返回 None
    pub async fn generate_task_plan(
        &self,
        message: &str,
        context_hint: Option<&str>,
    ) -> Option<TaskPlan> {
        let mut request = vec![Message::system(PLAN_PROMPT)];
        if let Some(hint) = context_hint.filter(|h| !h.trim().is_empty()) {
            request.push(Message::system(format!("Conversation context:\n{hint}")));
        }
        request.push(Message::user(message));

        let output = match self.llm.complete(&request).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Plan generation failed: {}", e);
                return None;
            }
        };
        let plan = self.parse_plan(&output, message);
        match &plan {
            Some(p) => tracing::info!(steps = p.steps.len(), goal = %p.goal, "task plan generated"),
            None => tracing::warn!("Plan generation produced no usable steps"),
        }
        plan
    }

    /// 校验并规整模型给出的计划
    pub fn parse_plan(&self, output: &str, message: &str) -> Option<TaskPlan> {
        let json = extract_json(output)?;
        let raw: RawPlan = match serde_json::from_str(json) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Plan JSON invalid: {}", e);
                return None;
            }
        };

        let mut seen = HashSet::new();
        let mut steps = Vec::new();
        for (index, raw_step) in raw.steps.into_iter().enumerate() {
            if steps.len() >= self.config.max_steps {
                tracing::warn!(max = self.config.max_steps, "plan truncated to step cap");
                break;
            }
            let id = raw_step.id.unwrap_or(index as u32 + 1);
            if !seen.insert(id) {
                tracing::warn!(id, "duplicate step id dropped");
                continue;
            }
            let title = raw_step.title.unwrap_or_default().trim().to_string();
            let description = raw_step.description.unwrap_or_default().trim().to_string();
            if title.is_empty() && description.is_empty() {
                continue;
            }
            let agent_type = raw_step
                .agent_type
                .as_deref()
                .and_then(|s| s.parse::<AgentType>().ok());
            let dependencies = raw_step
                .dependencies
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_u64().map(|n| n as u32))
                .collect::<Vec<_>>();

            let mut step = TaskStep::new(
                id,
                if title.is_empty() { description.clone() } else { title },
                if description.is_empty() { message.to_string() } else { description },
            )
            .with_dependencies(dependencies);
            step.agent_type = agent_type;
            steps.push(step);
        }

        if steps.is_empty() {
            return None;
        }
        let goal = raw
            .goal
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| message.to_string());
        Some(TaskPlan::new(goal, steps))
    }
}
