//! 计划数据模型：TaskPlan / TaskStep / StepStatus / AgentType

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 专职 Agent 类型（封闭集合）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// 文件/文件夹增删改、移动、回收站、收藏
    File,
    /// 文档内容读写
    Document,
    /// 搜索与索引
    Search,
    /// 通用对话，只读工具
    General,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [
        AgentType::File,
        AgentType::Document,
        AgentType::Search,
        AgentType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::File => "file",
            AgentType::Document => "document",
            AgentType::Search => "search",
            AgentType::General => "general",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(AgentType::File),
            "document" => Ok(AgentType::Document),
            "search" => Ok(AgentType::Search),
            "general" => Ok(AgentType::General),
            other => Err(format!("unknown agent type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// 计划中的单个步骤；id 在计划内唯一，从 1 开始
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: u32,
    pub title: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStep {
    pub fn new(id: u32, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            status: StepStatus::Pending,
            agent_type: None,
            dependencies: Vec::new(),
            result: None,
            error: None,
        }
    }

    pub fn with_agent(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = u32>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }
}

/// 多步执行计划。is_complete 为真当且仅当没有非终态步骤
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub goal: String,
    pub steps: Vec<TaskStep>,
    /// 进度游标（仅用于展示，不参与调度）
    #[serde(default)]
    pub current_step: Option<u32>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl TaskPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        let current_step = steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.id);
        let is_complete = steps.iter().all(|s| s.status.is_terminal());
        Self {
            goal: goal.into(),
            steps,
            current_step,
            is_complete,
            summary: None,
        }
    }

    pub fn step(&self, id: u32) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: u32) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
