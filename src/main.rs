//! drivebee 命令行入口
//!
//! 初始化日志、装配运行时并启动 Worker 池，然后从 stdin 读取请求：
//! `/approve <id> [json]`、`/reject <id>`、`/status <task>`，其余内容作为聊天消息入队，事件逐行打印。
//! 任务收到 done 或 error 后即退订。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drivebee::config::{load_config, StoreSection};
use drivebee::core::{drain, ShutdownManager, ShutdownReason};
use drivebee::llm::create_llm_from_config;
use drivebee::memory::SharedConversationStore;
use drivebee::queue::{ChatJob, StreamEvent};
use drivebee::store::{MemoryStore, SharedStore, SqliteStore};
use drivebee::tools::HttpStorageBackend;
use drivebee::{create_runtime, observability, AssistantRuntime};
use tokio::io::{AsyncBufReadExt, BufReader};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let user_id = std::env::var("DRIVEBEE_USER").unwrap_or_else(|_| "local".to_string());

    let store = open_store(&cfg.store)?;
    let llm = create_llm_from_config(&cfg);
    let backend = Arc::new(HttpStorageBackend::new(
        cfg.storage.base_url.clone(),
        cfg.storage.timeout_secs,
    ));
    let conversations = Arc::new(SharedConversationStore::new(Arc::clone(&store)));
    let runtime = create_runtime(cfg, store, llm, backend, conversations)
        .context("Failed to build runtime")?;

    let requeued = runtime
        .queue
        .requeue_interrupted()
        .await
        .context("Failed to recover interrupted jobs")?;
    if requeued > 0 {
        tracing::info!(requeued, "resuming jobs interrupted by the last shutdown");
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let handles = runtime.start(shutdown.token());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            shutdown.shutdown(ShutdownReason::InputClosed);
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = handle_line(&runtime, &user_id, line).await {
            eprintln!("error: {e:#}");
        }
    }

    let joined = drain(handles, DRAIN_TIMEOUT).await;
    tracing::info!(joined, "drivebee stopped");
    Ok(())
}

fn open_store(cfg: &StoreSection) -> anyhow::Result<Arc<dyn SharedStore>> {
    match cfg.backend.as_str() {
        "sqlite" => {
            let store = SqliteStore::open(&cfg.path)
                .with_context(|| format!("Failed to open store at {}", cfg.path))?;
            Ok(Arc::new(store))
        }
        "memory" => {
            tracing::warn!("memory store selected, queued jobs and approvals are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        other => anyhow::bail!("unknown store backend: {other}"),
    }
}

async fn handle_line(runtime: &AssistantRuntime, user_id: &str, line: &str) -> anyhow::Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/approve" | "/reject" => {
            let (id, args) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let modified_args = if args.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str(args).context("modified args must be JSON")?)
            };
            let resolved = runtime
                .resolve_approval(id, user_id, command == "/approve", modified_args)
                .await?;
            match resolved {
                Some(req) => println!("approval {} -> {:?}", req.id, req.status),
                None => println!("approval {id} is not pending"),
            }
        }
        "/status" => {
            let status = runtime.get_status(rest.trim()).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        _ => {
            let task_id = uuid::Uuid::new_v4().to_string();
            // 先订阅再入队，不漏事件
            runtime
                .subscribe_until_finished(
                    &task_id,
                    Arc::new(|event: StreamEvent| match serde_json::to_string(&event) {
                        Ok(json) => println!("{json}"),
                        Err(e) => tracing::warn!("Unprintable event: {}", e),
                    }),
                )
                .await?;
            runtime
                .enqueue(ChatJob {
                    task_id: task_id.clone(),
                    user_id: user_id.to_string(),
                    message: line.to_string(),
                    conversation_id: format!("cli:{user_id}"),
                    context: None,
                })
                .await?;
            println!("task {task_id} queued");
        }
    }
    Ok(())
}
