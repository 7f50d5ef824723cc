//! 任务规划：计划数据模型、规划器（是否拆解 + 生成计划）、步骤状态迁移

pub mod planner;
pub mod tracker;
pub mod types;

pub use planner::{count_cues, TaskPlanner};
pub use tracker::TaskPlanTracker;
pub use types::{AgentType, StepStatus, TaskPlan, TaskStep};
