//! Worker 池：固定数量的循环从队列拉取作业，执行处理函数，并把产生的事件按顺序转发到总线
//!
//! 每个作业还监听 task:{id}:control 频道，收到断开通知时取消该作业的 CancellationToken
//! （只影响审批等待，已发出的模型/工具调用照常完成）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::queue::{ChatJob, EventBus, EventSink, JobRecord, StreamEvent, TaskQueue};

/// 作业执行上下文
#[derive(Clone)]
pub struct JobContext {
    pub events: EventSink,
    pub cancel: CancellationToken,
}

/// 队列的处理函数
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// 返回最终回复文本；Err 使作业进入 Failed
    async fn process(&self, job: &ChatJob, ctx: JobContext) -> Result<String, AgentError>;
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
    processor: Arc<dyn JobProcessor>,
    concurrency: usize,
    poll_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        bus: Arc<EventBus>,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            bus,
            processor,
            concurrency: concurrency.max(1),
            poll_timeout,
        }
    }

    /// 启动所有 Worker 循环；shutdown 取消后各循环在当前作业完成后退出
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.concurrency)
            .map(|index| {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(index, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, index: usize, shutdown: CancellationToken) {
        tracing::info!(worker = index, "worker started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.next_job(self.poll_timeout) => next,
            };
            match next {
                Ok(Some(record)) => self.run_job(record).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker = index, "Queue poll failed: {}", e);
                    tokio::time::sleep(self.poll_timeout).await;
                }
            }
        }
        tracing::info!(worker = index, "worker stopped");
    }

    /// 执行一条已认领的作业
    pub async fn run_job(&self, record: JobRecord) {
        let job = record.job;
        let task_id = job.task_id.clone();
        tracing::info!(task_id = %task_id, user = %job.user_id, "job started");

        let (events, mut rx) = EventSink::channel();
        let forwarder = {
            let bus = Arc::clone(&self.bus);
            let task_id = task_id.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = bus.publish(&task_id, &event).await {
                        tracing::warn!(task_id = %task_id, "Event publish failed: {}", e);
                    }
                }
            })
        };

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let watcher = match self.queue.subscribe_control(&task_id).await {
            Ok(mut control) => {
                let cancel = cancel.clone();
                let finished = finished.clone();
                let task_id = task_id.clone();
                Some(tokio::spawn(async move {
                    tokio::select! {
                        msg = control.recv() => {
                            if msg.is_some() {
                                tracing::info!(task_id = %task_id, "client disconnected, cancelling approval waits");
                                cancel.cancel();
                            }
                        }
                        _ = finished.cancelled() => {}
                    }
                }))
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Control channel unavailable: {}", e);
                None
            }
        };

        let ctx = JobContext {
            events: events.clone(),
            cancel,
        };
        let outcome = self.processor.process(&job, ctx).await;
        if let Err(e) = &outcome {
            tracing::error!(task_id = %task_id, "Job failed: {}", e);
            events.emit(StreamEvent::Error {
                message: e.to_string(),
            });
        }

        // 事件全部发出后再更新状态，状态查询看到终态时事件流已完整
        finished.cancel();
        drop(events);
        if let Err(e) = forwarder.await {
            tracing::warn!(task_id = %task_id, "Event forwarder aborted: {}", e);
        }
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        let stored = match outcome {
            Ok(text) => self.queue.complete(&task_id, text).await,
            Err(e) => self.queue.fail(&task_id, e.to_string()).await,
        };
        if let Err(e) = stored {
            tracing::error!(task_id = %task_id, "Failed to record job outcome: {}", e);
        }
    }
}
