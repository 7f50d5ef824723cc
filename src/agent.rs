//! 助手运行时
//!
//! create_runtime 把共享存储、模型、存储后端装配成完整的处理链：
//! 工具注册表 → 执行器 → 能力网关 → 各类 ToolAgent → 编排器 → 规划器 → 任务队列 / 事件总线 / Worker 池。
//! ChatProcessor 是队列的处理函数，对单条聊天请求跑「记忆 → 规划 → 编排或单步 → 回写会话」。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentDeps, AgentRegistry, AgentRequest, AgentRouter, StepContext};
use crate::config::AppConfig;
use crate::core::AgentError;
use crate::gateway::{ApprovalRequest, CapabilityGateway};
use crate::llm::LlmClient;
use crate::memory::{ConversationStore, MemoryManager, Message};
use crate::orchestrator::{needs_orchestration, Orchestrator};
use crate::planning::{AgentType, TaskPlan, TaskPlanner};
use crate::queue::{
    ChatJob, EventBus, EventHandler, JobContext, JobProcessor, QueueError, StreamEvent, TaskQueue,
    TaskStatus, Unsubscribe, WorkerPool,
};
use crate::store::{ResourceLock, SharedStore, StoreError};
use crate::tools::{register_catalogue, StorageBackend, ToolExecutor, ToolRegistry};

const ASSISTANT_PROMPT: &str = "You are a cloud-drive assistant. You help the user manage files, \
folders and documents in their drive. Be concise and report exactly what was done.";

/// 队列处理函数：一条聊天请求的完整流程
pub struct ChatProcessor {
    planner: TaskPlanner,
    router: AgentRouter,
    orchestrator: Orchestrator,
    memory: Arc<MemoryManager>,
    conversations: Arc<dyn ConversationStore>,
}

impl ChatProcessor {
    pub fn new(
        planner: TaskPlanner,
        router: AgentRouter,
        orchestrator: Orchestrator,
        memory: Arc<MemoryManager>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            planner,
            router,
            orchestrator,
            memory,
            conversations,
        }
    }

    /// 规划 → 编排；不需要编排时走单步直达
    async fn respond(
        &self,
        job: &ChatJob,
        conversation: &[Message],
        hint: Option<&str>,
        step_ctx: &StepContext,
    ) -> Result<(String, Option<TaskPlan>), AgentError> {
        let plan = if self.planner.should_plan_task(&job.message, hint).await {
            self.planner.generate_task_plan(&job.message, hint).await
        } else {
            None
        };

        if let Some(plan) = plan.as_ref().filter(|p| needs_orchestration(p)) {
            step_ctx.events.emit(StreamEvent::RouteDecision {
                planned: true,
                agent: None,
                reason: format!("{} steps", plan.steps.len()),
            });
            step_ctx.events.emit(StreamEvent::PlanAnnounced { plan: plan.clone() });
            let execution = self
                .orchestrator
                .execute_plan(plan.clone(), conversation, step_ctx)
                .await?;
            return Ok((execution.response, Some(execution.plan)));
        }

        let planned_agent = plan
            .as_ref()
            .and_then(|p| p.steps.first())
            .and_then(|s| s.agent_type);
        let (agent_type, reason) = match planned_agent {
            Some(agent_type) => (agent_type, "single-step plan".to_string()),
            None => (self.router.route(&job.message).await, "direct".to_string()),
        };
        step_ctx.events.emit(StreamEvent::RouteDecision {
            planned: false,
            agent: Some(agent_type),
            reason,
        });

        let agent = self
            .orchestrator
            .agents()
            .get(agent_type)
            .ok_or_else(|| AgentError::AgentNotFound(agent_type.to_string()))?;
        let output = agent
            .run(AgentRequest {
                messages: conversation.to_vec(),
                ctx: step_ctx.clone(),
            })
            .await?;
        Ok((output.content, None))
    }
}

/// 请求附带的上下文（当前文件夹、选中文件等）拼进 system 提示
fn context_prompt(job: &ChatJob) -> String {
    match &job.context {
        Some(Value::Null) | None => ASSISTANT_PROMPT.to_string(),
        Some(ctx) => format!("{ASSISTANT_PROMPT}\n\nClient context: {ctx}"),
    }
}

#[async_trait]
impl JobProcessor for ChatProcessor {
    async fn process(&self, job: &ChatJob, ctx: JobContext) -> Result<String, AgentError> {
        let mut record = self.conversations.load(&job.conversation_id).await?;
        record.messages.push(Message::user(job.message.clone()));

        let active_plan = record.plan.as_ref().filter(|p| !p.is_complete);
        let state = self
            .memory
            .build_memory_state(&record.messages, &record.summaries, active_plan)
            .await;
        record.summaries = state.summaries.clone();
        // 先落盘用户消息和新摘要，本轮失败也不丢
        self.conversations.save(&job.conversation_id, &record).await?;

        let conversation = MemoryManager::assemble_llm_messages(&context_prompt(job), &state);
        let hint = state.summaries.last().map(|s| s.summary.clone());
        let step_ctx = StepContext {
            user_id: job.user_id.clone(),
            conversation_id: job.conversation_id.clone(),
            step_id: None,
            events: ctx.events.clone(),
            cancel: ctx.cancel.clone(),
        };

        let (response, plan) = self
            .respond(job, &conversation, hint.as_deref(), &step_ctx)
            .await?;

        ctx.events.emit(StreamEvent::Content {
            text: response.clone(),
        });
        record.messages.push(Message::assistant(response.clone()));
        if plan.is_some() {
            record.plan = plan;
        }
        self.conversations.save(&job.conversation_id, &record).await?;
        ctx.events.emit(StreamEvent::Done {
            task_id: job.task_id.clone(),
        });
        Ok(response)
    }
}

/// 装配完成的运行时；传输层只通过这里的方法与引擎交互
pub struct AssistantRuntime {
    pub config: AppConfig,
    pub gateway: Arc<CapabilityGateway>,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<EventBus>,
    pub conversations: Arc<dyn ConversationStore>,
    pub workers: Arc<WorkerPool>,
}

impl AssistantRuntime {
    pub async fn enqueue(&self, job: ChatJob) -> Result<String, QueueError> {
        self.queue.enqueue(job).await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        self.queue.get_status(task_id).await
    }

    pub async fn subscribe(&self, task_id: &str, handler: EventHandler) -> Result<Unsubscribe, QueueError> {
        self.bus.subscribe(task_id, handler).await
    }

    /// 订阅到任务结束（done / error）为止，之后自动退订
    pub async fn subscribe_until_finished(
        &self,
        task_id: &str,
        handler: EventHandler,
    ) -> Result<(), QueueError> {
        self.bus.subscribe_until_finished(task_id, handler).await
    }

    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        user_id: &str,
        approved: bool,
        modified_args: Option<Value>,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        self.gateway
            .resolve_approval(approval_id, user_id, approved, modified_args)
            .await
    }

    pub async fn signal_disconnect(&self, task_id: &str) -> Result<usize, QueueError> {
        self.queue.signal_disconnect(task_id).await
    }

    /// 启动 Worker 循环与审批清扫任务
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Arc::clone(&self.workers).spawn(shutdown.clone());
        handles.push(self.gateway.spawn_sweeper(shutdown));
        handles
    }
}

/// 按配置装配运行时
pub fn create_runtime(
    cfg: AppConfig,
    store: Arc<dyn SharedStore>,
    llm: Arc<dyn LlmClient>,
    backend: Arc<dyn StorageBackend>,
    conversations: Arc<dyn ConversationStore>,
) -> Result<AssistantRuntime, AgentError> {
    let default_agent: AgentType = cfg
        .orchestrator
        .default_agent
        .parse()
        .map_err(AgentError::ConfigError)?;

    let mut tools = ToolRegistry::new();
    register_catalogue(&mut tools, backend);
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(tools),
        cfg.orchestrator.tool_timeout_secs,
    ));

    let gateway = Arc::new(CapabilityGateway::new(Arc::clone(&store), &cfg.gateway));
    let locks = ResourceLock::new(
        Arc::clone(&store),
        Duration::from_secs(cfg.gateway.lock_ttl_secs),
        Duration::from_millis(cfg.gateway.lock_wait_ms),
    );
    let memory = Arc::new(MemoryManager::new(Arc::clone(&llm), cfg.memory.clone()));

    let agents = AgentRegistry::with_tool_agents(AgentDeps {
        llm: Arc::clone(&llm),
        executor,
        gateway: Arc::clone(&gateway),
        locks,
        memory: Arc::clone(&memory),
        max_tool_calls: cfg.orchestrator.max_tool_calls_per_turn,
    });
    let orchestrator = Orchestrator::new(agents, cfg.orchestrator.max_tool_retries, default_agent);

    let processor = Arc::new(ChatProcessor::new(
        TaskPlanner::new(Arc::clone(&llm), cfg.planner.clone()),
        AgentRouter::new(llm, default_agent),
        orchestrator,
        memory,
        Arc::clone(&conversations),
    ));

    let queue = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        Duration::from_secs(cfg.queue.result_retention_secs),
    ));
    let bus = Arc::new(EventBus::new(store));
    let workers = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&bus),
        processor,
        cfg.queue.worker_concurrency,
        Duration::from_millis(cfg.queue.poll_timeout_ms),
    ));

    tracing::info!(
        default_agent = %default_agent,
        workers = cfg.queue.worker_concurrency,
        "assistant runtime ready"
    );
    Ok(AssistantRuntime {
        config: cfg,
        gateway,
        queue,
        bus,
        conversations,
        workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryConversationStore;
    use crate::queue::EventSink;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StorageBackend for Recording {
        async fn call(&self, op: &str, _args: &Value) -> Result<String, String> {
            self.calls.lock().unwrap().push(op.to_string());
            Ok(format!("{op} ok"))
        }
    }

    fn runtime(llm: MockLlmClient) -> (AssistantRuntime, Arc<Recording>) {
        let backend = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
        });
        let rt = create_runtime(
            AppConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(llm),
            backend.clone(),
            Arc::new(InMemoryConversationStore::new()),
        )
        .unwrap();
        (rt, backend)
    }

    fn job(message: &str) -> ChatJob {
        ChatJob {
            task_id: "t1".into(),
            user_id: "u1".into(),
            message: message.into(),
            conversation_id: "c1".into(),
            context: Some(json!({"folderId": "root"})),
        }
    }

    #[test]
    fn test_unknown_default_agent_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.orchestrator.default_agent = "calendar".into();
        let err = create_runtime(
            cfg,
            Arc::new(MemoryStore::new()),
            Arc::new(MockLlmClient::echo()),
            Arc::new(Recording {
                calls: Mutex::new(Vec::new()),
            }),
            Arc::new(InMemoryConversationStore::new()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_missing_agent_keeps_user_message() {
        // 短消息不规划；模型回显不是合法路由，退回 general
        let (rt, backend) = runtime(MockLlmClient::echo());
        let (events, mut rx) = EventSink::channel();
        let ctx = JobContext {
            events,
            cancel: CancellationToken::new(),
        };
        let processor = ChatProcessor::new(
            TaskPlanner::new(Arc::new(MockLlmClient::echo()), Default::default()),
            AgentRouter::new(Arc::new(MockLlmClient::echo()), AgentType::General),
            Orchestrator::new(AgentRegistry::new(), 2, AgentType::General),
            Arc::new(MemoryManager::new(Arc::new(MockLlmClient::echo()), Default::default())),
            Arc::clone(&rt.conversations),
        );
        // 注册表为空：单步直达找不到 Agent
        let err = processor.process(&job("hi"), ctx).await.unwrap_err();
        assert!(matches!(err, AgentError::AgentNotFound(_)));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "route_decision");
        // 用户消息已落盘
        let record = rt.conversations.load("c1").await.unwrap();
        assert_eq!(record.messages.len(), 1);
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_step_through_queue() {
        let llm = MockLlmClient::from_fn(|messages| {
            let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
            if last.starts_with("[list_files]") {
                Ok("You have 2 files.".into())
            } else {
                Ok(r#"{"tool": "list_files", "args": {"folderId": "root"}}"#.into())
            }
        });
        let (rt, backend) = runtime(llm);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _unsub = rt
            .subscribe(
                "t1",
                Arc::new(move |ev: StreamEvent| sink.lock().unwrap().push(ev.kind().to_string())),
            )
            .await
            .unwrap();

        rt.enqueue(job("list my files")).await.unwrap();
        let record = rt.queue.next_job(Duration::from_millis(50)).await.unwrap().unwrap();
        rt.workers.run_job(record).await;

        assert_eq!(
            rt.get_status("t1").await.unwrap(),
            TaskStatus::Completed {
                result: "You have 2 files.".into()
            }
        );
        assert_eq!(*backend.calls.lock().unwrap(), vec!["list_files".to_string()]);
        let conv = rt.conversations.load("c1").await.unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[1].content, "You have 2 files.");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let kinds = seen.lock().unwrap().clone();
        assert_eq!(kinds.first().map(String::as_str), Some("route_decision"));
        assert_eq!(kinds.last().map(String::as_str), Some("done"));
        assert!(kinds.contains(&"tool_call_end".to_string()));
    }
}
