//! TaskPlanTracker：纯函数式的步骤状态迁移
//!
//! 每个操作都克隆计划后修改并重算 current_step / is_complete。
//! current_step 只是展示用游标，调度顺序由编排器按 dependencies 计算。

use super::types::{StepStatus, TaskPlan};

pub struct TaskPlanTracker;

impl TaskPlanTracker {
    pub fn start_current_step(plan: &TaskPlan) -> TaskPlan {
        Self::update_current(plan, StepStatus::InProgress, None)
    }

    pub fn complete_current_step(plan: &TaskPlan, result: impl Into<String>) -> TaskPlan {
        Self::update_current(plan, StepStatus::Completed, Some(result.into()))
    }

    pub fn fail_current_step(plan: &TaskPlan, error: impl Into<String>) -> TaskPlan {
        Self::update_current(plan, StepStatus::Failed, Some(error.into()))
    }

    pub fn skip_current_step(plan: &TaskPlan, reason: impl Into<String>) -> TaskPlan {
        Self::update_current(plan, StepStatus::Skipped, Some(reason.into()))
    }

    /// 按 id 设置任意步骤的状态（编排器按波次更新时使用）。
    /// Completed 的 detail 写入 result，Failed / Skipped 的 detail 写入 error。
    pub fn set_step_status(
        plan: &TaskPlan,
        step_id: u32,
        status: StepStatus,
        detail: Option<String>,
    ) -> TaskPlan {
        let mut next = plan.clone();
        if let Some(step) = next.step_mut(step_id) {
            step.status = status;
            match status {
                StepStatus::Completed => step.result = detail,
                StepStatus::Failed | StepStatus::Skipped => step.error = detail,
                StepStatus::Pending | StepStatus::InProgress => {}
            }
        }
        Self::recompute(&mut next);
        next
    }

    fn update_current(plan: &TaskPlan, status: StepStatus, detail: Option<String>) -> TaskPlan {
        match plan.current_step {
            Some(id) => Self::set_step_status(plan, id, status, detail),
            None => {
                let mut next = plan.clone();
                Self::recompute(&mut next);
                next
            }
        }
    }

    /// 游标指向第一个进行中的步骤，没有则指向第一个待执行步骤
    pub fn recompute(plan: &mut TaskPlan) {
        plan.current_step = plan
            .steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
            .or_else(|| plan.steps.iter().find(|s| s.status == StepStatus::Pending))
            .map(|s| s.id);
        plan.is_complete = plan.steps.iter().all(|s| s.status.is_terminal());
    }

    /// 面向用户的进度文本
    pub fn render_progress(plan: &TaskPlan) -> String {
        let done = plan.count(StepStatus::Completed);
        let mut out = format!(
            "Goal: {}\nProgress: {}/{} steps completed\n",
            plan.goal,
            done,
            plan.steps.len()
        );
        for step in &plan.steps {
            let mark = match step.status {
                StepStatus::Pending => "[ ]",
                StepStatus::InProgress => "[~]",
                StepStatus::Completed => "[x]",
                StepStatus::Failed => "[!]",
                StepStatus::Skipped => "[-]",
            };
            out.push_str(&format!("{} {}. {}", mark, step.id, step.title));
            match step.status {
                StepStatus::Failed => {
                    if let Some(err) = &step.error {
                        out.push_str(&format!(" (failed: {err})"));
                    }
                }
                StepStatus::Skipped => {
                    if let Some(reason) = &step.error {
                        out.push_str(&format!(" (skipped: {reason})"));
                    }
                }
                _ => {}
            }
            out.push('\n');
        }
        out
    }
}
