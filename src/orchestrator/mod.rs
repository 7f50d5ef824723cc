//! DAG 编排器：按依赖逐波次并发执行计划步骤
//!
//! 每一波取出所有依赖均已终态的 Pending 步骤并发执行（失败的依赖同样解除阻塞）；
//! 没有可执行步骤时结束，剩余 Pending 一律标记为 Skipped("unreachable")，因此环依赖与悬空依赖也能终止。
//! 模型传输失败是硬错误：所在波次结束后不再派发后续步骤，错误直接返回给调用方。

use std::collections::HashSet;

use futures_util::future::join_all;

use crate::agents::{AgentRegistry, AgentRequest, StepContext};
use crate::core::AgentError;
use crate::memory::Message;
use crate::planning::{AgentType, StepStatus, TaskPlan, TaskPlanTracker, TaskStep};
use crate::queue::StreamEvent;

const DETAIL_PREVIEW_CHARS: usize = 200;

/// 多于一个步骤或跨多种 Agent 的计划走编排
pub fn needs_orchestration(plan: &TaskPlan) -> bool {
    let agent_types: HashSet<Option<AgentType>> = plan.steps.iter().map(|s| s.agent_type).collect();
    plan.steps.len() > 1 || agent_types.len() > 1
}

/// 单个步骤的执行结果
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step_id: u32,
    pub success: bool,
    /// 成功时为 Agent 输出，失败时为最后一次错误
    pub output: String,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct PlanExecution {
    pub plan: TaskPlan,
    pub response: String,
    /// 执行过的波次数
    pub waves: usize,
}

pub struct Orchestrator {
    agents: AgentRegistry,
    max_tool_retries: u32,
    default_agent: AgentType,
}

impl Orchestrator {
    pub fn new(agents: AgentRegistry, max_tool_retries: u32, default_agent: AgentType) -> Self {
        Self {
            agents,
            max_tool_retries,
            default_agent,
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn default_agent(&self) -> AgentType {
        self.default_agent
    }

    pub async fn execute_plan(
        &self,
        plan: TaskPlan,
        conversation: &[Message],
        ctx: &StepContext,
    ) -> Result<PlanExecution, AgentError> {
        let mut plan = plan;
        let mut completed: HashSet<u32> = HashSet::new();
        let mut failed: HashSet<u32> = HashSet::new();
        let mut completion_order: Vec<u32> = Vec::new();
        let mut waves = 0;

        loop {
            let ready: Vec<TaskStep> = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .filter(|s| {
                    s.dependencies
                        .iter()
                        .all(|d| completed.contains(d) || failed.contains(d))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            waves += 1;
            tracing::debug!(
                wave = waves,
                steps = ?ready.iter().map(|s| s.id).collect::<Vec<_>>(),
                "dispatching wave"
            );

            for step in &ready {
                plan = TaskPlanTracker::set_step_status(&plan, step.id, StepStatus::InProgress, None);
                emit_step(ctx, step, StepStatus::InProgress, None);
            }

            let snapshot = plan.clone();
            let outcomes = join_all(
                ready
                    .iter()
                    .map(|step| self.execute_step(step, &snapshot, conversation, ctx)),
            )
            .await;

            let mut fatal: Option<AgentError> = None;
            for (step, outcome) in ready.iter().zip(outcomes) {
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let message = e.to_string();
                        plan = TaskPlanTracker::set_step_status(
                            &plan,
                            step.id,
                            StepStatus::Failed,
                            Some(message.clone()),
                        );
                        emit_step(ctx, step, StepStatus::Failed, Some(preview(&message)));
                        fatal.get_or_insert(e);
                        continue;
                    }
                };
                let status = if outcome.success {
                    completed.insert(step.id);
                    completion_order.push(step.id);
                    StepStatus::Completed
                } else {
                    failed.insert(step.id);
                    StepStatus::Failed
                };
                plan = TaskPlanTracker::set_step_status(&plan, step.id, status, Some(outcome.output.clone()));
                emit_step(ctx, step, status, Some(preview(&outcome.output)));
            }
            if let Some(e) = fatal {
                tracing::error!(wave = waves, "provider failure, abandoning plan: {}", e);
                return Err(e);
            }
        }

        let unreachable: Vec<TaskStep> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .cloned()
            .collect();
        for step in &unreachable {
            tracing::warn!(step = step.id, "step unreachable, skipping");
            plan = TaskPlanTracker::set_step_status(
                &plan,
                step.id,
                StepStatus::Skipped,
                Some("unreachable".to_string()),
            );
            emit_step(ctx, step, StepStatus::Skipped, Some("unreachable".to_string()));
        }

        plan.is_complete = true;
        plan.current_step = None;
        let response = assemble_final_response(&plan, &completion_order);
        tracing::info!(
            waves,
            completed = completed.len(),
            failed = failed.len(),
            skipped = unreachable.len(),
            "plan finished"
        );
        Ok(PlanExecution {
            plan,
            response,
            waves,
        })
    }

    /// 执行单个步骤：工具结果全部出错时带上失败说明重试，Agent 缺失或返回 Err 时直接失败；
    /// 硬错误（见 AgentError::is_fatal）原样返回
    pub async fn execute_step(
        &self,
        step: &TaskStep,
        plan: &TaskPlan,
        conversation: &[Message],
        ctx: &StepContext,
    ) -> Result<StepOutcome, AgentError> {
        let agent_type = step.agent_type.unwrap_or(self.default_agent);
        let Some(agent) = self.agents.get(agent_type) else {
            tracing::warn!(step = step.id, agent = %agent_type, "no agent registered");
            return Ok(StepOutcome {
                step_id: step.id,
                success: false,
                output: format!("No agent registered for type: {agent_type}"),
                attempts: 0,
            });
        };

        let base = build_step_messages(conversation, plan, step);
        let mut last_error: Option<String> = None;
        let mut attempts = 0;

        while attempts <= self.max_tool_retries {
            attempts += 1;
            let mut messages = base.clone();
            if let Some(err) = &last_error {
                messages.push(Message::user(format!(
                    "Previous attempt failed: {err}. Try a different approach."
                )));
            }
            let request = AgentRequest {
                messages,
                ctx: StepContext {
                    step_id: Some(step.id),
                    ..ctx.clone()
                },
            };

            match agent.run(request).await {
                Ok(output) if output.only_errors() => {
                    let err = output.last_error().unwrap_or("tool call failed").to_string();
                    tracing::warn!(step = step.id, attempt = attempts, "step attempt failed: {}", err);
                    last_error = Some(err);
                }
                Ok(output) => {
                    return Ok(StepOutcome {
                        step_id: step.id,
                        success: true,
                        output: output.content,
                        attempts,
                    });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(step = step.id, "Agent error: {}", e);
                    return Ok(StepOutcome {
                        step_id: step.id,
                        success: false,
                        output: e.to_string(),
                        attempts,
                    });
                }
            }
        }

        Ok(StepOutcome {
            step_id: step.id,
            success: false,
            output: last_error.unwrap_or_else(|| "step failed".to_string()),
            attempts,
        })
    }
}

fn preview(text: &str) -> String {
    text.chars().take(DETAIL_PREVIEW_CHARS).collect()
}

fn emit_step(ctx: &StepContext, step: &TaskStep, status: StepStatus, detail: Option<String>) {
    ctx.events.emit(StreamEvent::StepUpdate {
        step_id: step.id,
        title: step.title.clone(),
        status,
        detail,
    });
}

/// 步骤级消息：原始对话 + 已结束步骤的结果概述（assistant）+ 仅含当前步骤指令的 user 消息
pub fn build_step_messages(conversation: &[Message], plan: &TaskPlan, step: &TaskStep) -> Vec<Message> {
    let mut messages = conversation.to_vec();

    let finished: Vec<String> = plan
        .steps
        .iter()
        .filter(|s| s.id != step.id)
        .filter_map(|s| match s.status {
            StepStatus::Completed => Some(format!(
                "- Step {} ({}) completed: {}",
                s.id,
                s.title,
                s.result.as_deref().unwrap_or("")
            )),
            StepStatus::Failed => Some(format!(
                "- Step {} ({}) failed: {}",
                s.id,
                s.title,
                s.error.as_deref().unwrap_or("unknown error")
            )),
            StepStatus::Skipped => Some(format!("- Step {} ({}) skipped", s.id, s.title)),
            StepStatus::Pending | StepStatus::InProgress => None,
        })
        .collect();
    if !finished.is_empty() {
        messages.push(Message::assistant(format!(
            "Progress on \"{}\" so far:\n{}",
            plan.goal,
            finished.join("\n")
        )));
    }

    messages.push(Message::user(format!(
        "Current step {} of {}: {}\n{}\nDo only this step.",
        step.id,
        plan.steps.len(),
        step.title,
        step.description
    )));
    messages
}

/// 最终回复：最后一个成功步骤的输出 + 计划进度；全部失败时逐条列出失败原因
pub fn assemble_final_response(plan: &TaskPlan, completion_order: &[u32]) -> String {
    let progress = TaskPlanTracker::render_progress(plan);
    let last_success = completion_order
        .iter()
        .rev()
        .filter_map(|id| plan.step(*id))
        .find(|s| s.status == StepStatus::Completed);

    match last_success {
        Some(step) => format!("{}\n\n{}", step.result.as_deref().unwrap_or(""), progress),
        None => {
            let failures: Vec<String> = plan
                .steps
                .iter()
                .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
                .map(|s| {
                    format!(
                        "- Step {} ({}): {}",
                        s.id,
                        s.title,
                        s.error.as_deref().unwrap_or("failed")
                    )
                })
                .collect();
            format!("I couldn't complete this request:\n{}", failures.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentOutput};
    use crate::core::AgentError;
    use crate::llm::LlmError;
    use crate::queue::EventSink;
    use crate::tools::ToolResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    /// 记录每次调用时看到的"当前步骤"以及同时在执行的步骤数
    struct ScriptedAgent {
        agent_type: AgentType,
        log: Arc<Mutex<Vec<String>>>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
        behaviour: fn(&str, usize) -> Result<AgentOutput, AgentError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn agent_type(&self) -> AgentType {
            self.agent_type
        }

        async fn run(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
            let n = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(n, Ordering::SeqCst);
            let instruction = request
                .messages
                .iter()
                .rev()
                .find(|m| m.content.starts_with("Current step"))
                .map(|m| m.content.clone())
                .unwrap_or_default();
            self.log.lock().unwrap().push(instruction.clone());
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behaviour)(&instruction, call)
        }
    }

    struct Fixture {
        log: Arc<Mutex<Vec<String>>>,
        max_running: Arc<AtomicUsize>,
        orchestrator: Orchestrator,
    }

    fn fixture(behaviour: fn(&str, usize) -> Result<AgentOutput, AgentError>) -> Fixture {
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let mut agents = AgentRegistry::new();
        for agent_type in [AgentType::Search, AgentType::General, AgentType::File] {
            agents.register(Arc::new(ScriptedAgent {
                agent_type,
                log: Arc::clone(&log),
                running: Arc::clone(&running),
                max_running: Arc::clone(&max_running),
                behaviour,
                calls: AtomicUsize::new(0),
            }));
        }
        Fixture {
            log,
            max_running,
            orchestrator: Orchestrator::new(agents, 2, AgentType::General),
        }
    }

    fn ok(text: &str) -> Result<AgentOutput, AgentError> {
        Ok(AgentOutput {
            content: text.to_string(),
            tool_results: vec![ToolResult::ok("list_files", "[]")],
        })
    }

    fn ctx() -> (StepContext, tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = EventSink::channel();
        (
            StepContext {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                step_id: None,
                events,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn step(id: u32, deps: &[u32]) -> TaskStep {
        TaskStep::new(id, format!("S{id}"), format!("do {id}"))
            .with_agent(AgentType::Search)
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_needs_orchestration() {
        let single = TaskPlan::new("g", vec![step(1, &[])]);
        assert!(!needs_orchestration(&single));
        let two = TaskPlan::new("g", vec![step(1, &[]), step(2, &[1])]);
        assert!(needs_orchestration(&two));
    }

    #[tokio::test]
    async fn test_wave_parallelism() {
        let f = fixture(|instruction, _| ok(&format!("done: {instruction}")));
        let plan = TaskPlan::new("g", vec![step(1, &[]), step(2, &[]), step(3, &[1, 2])]);
        let (ctx, _rx) = ctx();
        let exec = f.orchestrator.execute_plan(plan, &[Message::user("go")], &ctx).await.unwrap();

        assert_eq!(exec.waves, 2);
        assert_eq!(f.max_running.load(Ordering::SeqCst), 2);
        let log = f.log.lock().unwrap();
        assert!(log[2].starts_with("Current step 3"));
        assert!(exec.plan.is_complete);
        assert_eq!(exec.plan.count(StepStatus::Completed), 3);
        assert!(exec.response.starts_with("done: Current step 3"));
    }

    #[tokio::test]
    async fn test_budget_scenario_two_waves() {
        let f = fixture(|instruction, _| ok(instruction));
        let plan = TaskPlan::new(
            "budget",
            vec![
                TaskStep::new(1, "Search", "search for 'budget'").with_agent(AgentType::Search),
                TaskStep::new(2, "Summarize", "summarize findings")
                    .with_agent(AgentType::General)
                    .with_dependencies([1]),
            ],
        );
        let (ctx, mut rx) = ctx();
        let exec = f.orchestrator.execute_plan(plan, &[], &ctx).await.unwrap();
        assert_eq!(exec.waves, 2);
        assert_eq!(f.max_running.load(Ordering::SeqCst), 1);

        let mut updates = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let StreamEvent::StepUpdate { step_id, status, .. } = ev {
                updates.push((step_id, status));
            }
        }
        assert_eq!(
            updates,
            vec![
                (1, StepStatus::InProgress),
                (1, StepStatus::Completed),
                (2, StepStatus::InProgress),
                (2, StepStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_cycles_and_dangling_deps_terminate() {
        let f = fixture(|_, _| ok("fine"));
        let plan = TaskPlan::new(
            "g",
            vec![
                step(1, &[]),
                step(2, &[3]),
                step(3, &[2]),
                step(4, &[42]),
                step(5, &[5]),
            ],
        );
        let (ctx, _rx) = ctx();
        let exec = f.orchestrator.execute_plan(plan, &[], &ctx).await.unwrap();
        assert!(exec.plan.is_complete);
        assert!(exec.plan.steps.iter().all(|s| s.status.is_terminal()));
        assert_eq!(exec.plan.count(StepStatus::Completed), 1);
        assert_eq!(exec.plan.count(StepStatus::Skipped), 4);
        assert_eq!(exec.plan.step(4).unwrap().error.as_deref(), Some("unreachable"));
    }

    #[tokio::test]
    async fn test_failed_dependency_unblocks_dependent() {
        let f = fixture(|instruction, _| {
            if instruction.starts_with("Current step 1") {
                Ok(AgentOutput {
                    content: "nothing".into(),
                    tool_results: vec![ToolResult::error("search_files", "index offline")],
                })
            } else {
                ok("summarized without input")
            }
        });
        let plan = TaskPlan::new("g", vec![step(1, &[]), step(2, &[1])]);
        let (ctx, _rx) = ctx();
        let exec = f.orchestrator.execute_plan(plan, &[], &ctx).await.unwrap();

        let s1 = exec.plan.step(1).unwrap();
        assert_eq!(s1.status, StepStatus::Failed);
        assert_eq!(s1.error.as_deref(), Some("index offline"));
        assert_eq!(exec.plan.step(2).unwrap().status, StepStatus::Completed);

        // 1 次尝试 + 2 次重试，随后步骤 2 执行一次
        let log = f.log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert!(exec.response.starts_with("summarized without input"));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let f = fixture(|_, call| {
            if call == 0 {
                Ok(AgentOutput {
                    content: String::new(),
                    tool_results: vec![ToolResult::error("move_file", "locked")],
                })
            } else {
                ok("moved")
            }
        });
        let plan = TaskPlan::new("g", vec![step(1, &[])]);
        let (ctx, _rx) = ctx();
        let exec = f.orchestrator.execute_plan(plan, &[], &ctx).await.unwrap();
        assert_eq!(exec.plan.step(1).unwrap().status, StepStatus::Completed);
        assert_eq!(f.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_agent_and_agent_error_fail_without_retry() {
        let f = fixture(|_, _| Err(AgentError::ToolTimeout("search_files".into())));
        let plan = TaskPlan::new(
            "g",
            vec![
                step(1, &[]),
                TaskStep::new(2, "Edit", "edit doc").with_agent(AgentType::Document),
            ],
        );
        let (ctx, _rx) = ctx();
        let exec = f.orchestrator.execute_plan(plan, &[], &ctx).await.unwrap();
        assert_eq!(f.log.lock().unwrap().len(), 1);
        assert!(exec
            .plan
            .step(2)
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .starts_with("No agent registered"));
        assert!(exec.response.starts_with("I couldn't complete this request:"));
        assert!(exec.response.contains("- Step 1 (S1): Tool timeout: search_files"));
    }

    #[tokio::test]
    async fn test_provider_failure_ends_plan() {
        let f = fixture(|_, _| {
            Err(AgentError::Llm(LlmError::Http {
                status: 503,
                body: "unavailable".into(),
            }))
        });
        let plan = TaskPlan::new("g", vec![step(1, &[]), step(2, &[1])]);
        let (ctx, mut rx) = ctx();
        let err = f.orchestrator.execute_plan(plan, &[], &ctx).await.unwrap_err();
        assert!(err.is_fatal());

        // 不重试，也不派发依赖它的步骤 2
        assert_eq!(f.log.lock().unwrap().len(), 1);
        let mut updates = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let StreamEvent::StepUpdate { step_id, status, .. } = ev {
                updates.push((step_id, status));
            }
        }
        assert_eq!(
            updates,
            vec![(1, StepStatus::InProgress), (1, StepStatus::Failed)]
        );
    }

    #[test]
    fn test_step_messages_include_finished_steps() {
        let mut plan = TaskPlan::new("budget", vec![step(1, &[]), step(2, &[1])]);
        plan = TaskPlanTracker::set_step_status(&plan, 1, StepStatus::Completed, Some("budget.xlsx".into()));
        let messages = build_step_messages(&[Message::user("original")], &plan, &plan.steps[1].clone());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "original");
        assert!(messages[1].content.contains("Step 1 (S1) completed: budget.xlsx"));
        assert!(messages[2].content.starts_with("Current step 2 of 2: S2"));
    }
}
