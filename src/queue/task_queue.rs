//! 任务队列：每个聊天请求一条作业，以调用方给定的 taskId 去重，至多执行一次
//!
//! 作业记录存于 job:{taskId}，待执行 id 排在列表 queue:jobs 中；
//! Worker 以 CAS 把 Pending 认领为 Active，完成或失败后记录保留 result_retention 供迟到的状态查询。
//! 用户的进行中任务索引为集合 user:{userId}:active_tasks。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::QueueError;
use crate::store::{get_json, update_json, SharedStore, Subscription};

const QUEUE_KEY: &str = "queue:jobs";

fn job_key(task_id: &str) -> String {
    format!("job:{task_id}")
}

fn active_key(user_id: &str) -> String {
    format!("user:{user_id}:active_tasks")
}

pub fn control_channel(task_id: &str) -> String {
    format!("task:{task_id}:control")
}

/// 一个聊天请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatJob {
    /// 去重键；为空时入队时生成
    pub task_id: String,
    pub user_id: String,
    pub message: String,
    pub conversation_id: String,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job: ChatJob,
    pub state: JobState,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub enqueued_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

/// 对外的状态契约
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    NotFound,
    Pending,
    Active,
    Completed { result: String },
    Failed { error: String },
}

impl From<&JobRecord> for TaskStatus {
    fn from(record: &JobRecord) -> Self {
        match record.state {
            JobState::Pending => TaskStatus::Pending,
            JobState::Active => TaskStatus::Active,
            JobState::Completed => TaskStatus::Completed {
                result: record.result.clone().unwrap_or_default(),
            },
            JobState::Failed => TaskStatus::Failed {
                error: record.error.clone().unwrap_or_default(),
            },
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct TaskQueue {
    store: Arc<dyn SharedStore>,
    retention: Duration,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn SharedStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// 入队并返回 taskId；同一 taskId 重复提交不会产生第二次执行
    pub async fn enqueue(&self, mut job: ChatJob) -> Result<String, QueueError> {
        if job.task_id.trim().is_empty() {
            job.task_id = uuid::Uuid::new_v4().to_string();
        }
        let task_id = job.task_id.clone();
        let user_id = job.user_id.clone();
        let record = JobRecord {
            job,
            state: JobState::Pending,
            result: None,
            error: None,
            enqueued_at: now_ms(),
            started_at: None,
            finished_at: None,
        };

        let created = self
            .store
            .set_nx(&job_key(&task_id), serde_json::to_string(&record)?, None)
            .await?;
        if !created {
            tracing::info!(task_id = %task_id, "duplicate enqueue ignored");
            return Ok(task_id);
        }
        self.store.set_add(&active_key(&user_id), &task_id).await?;
        self.store.list_push(QUEUE_KEY, task_id.clone()).await?;
        tracing::info!(task_id = %task_id, user = %user_id, "job enqueued");
        Ok(task_id)
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        Ok(self
            .record(task_id)
            .await?
            .as_ref()
            .map(TaskStatus::from)
            .unwrap_or(TaskStatus::NotFound))
    }

    pub async fn record(&self, task_id: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(get_json(self.store.as_ref(), &job_key(task_id)).await?)
    }

    /// 阻塞拉取下一条作业并认领；超时或认领失败返回 None
    pub async fn next_job(&self, timeout: Duration) -> Result<Option<JobRecord>, QueueError> {
        let Some(task_id) = self.store.list_pop(QUEUE_KEY, timeout).await? else {
            return Ok(None);
        };
        let claimed = self.claim(&task_id).await?;
        if claimed.is_none() {
            tracing::warn!(task_id = %task_id, "queued job could not be claimed");
        }
        Ok(claimed)
    }

    /// Pending → Active；其他状态一律拒绝，保证至多执行一次
    pub async fn claim(&self, task_id: &str) -> Result<Option<JobRecord>, QueueError> {
        let now = now_ms();
        Ok(update_json(self.store.as_ref(), &job_key(task_id), None, |mut r: JobRecord| {
            if r.state != JobState::Pending {
                return None;
            }
            r.state = JobState::Active;
            r.started_at = Some(now);
            Some(r)
        })
        .await?)
    }

    pub async fn complete(&self, task_id: &str, result: String) -> Result<(), QueueError> {
        self.finish(task_id, JobState::Completed, result).await
    }

    pub async fn fail(&self, task_id: &str, error: String) -> Result<(), QueueError> {
        self.finish(task_id, JobState::Failed, error).await
    }

    async fn finish(&self, task_id: &str, state: JobState, text: String) -> Result<(), QueueError> {
        let now = now_ms();
        let updated = update_json(
            self.store.as_ref(),
            &job_key(task_id),
            Some(self.retention),
            |mut r: JobRecord| {
                if r.state != JobState::Active {
                    return None;
                }
                r.state = state;
                match state {
                    JobState::Completed => r.result = Some(text.clone()),
                    _ => r.error = Some(text.clone()),
                }
                r.finished_at = Some(now);
                Some(r)
            },
        )
        .await?;

        match updated {
            Some(record) => {
                self.store
                    .set_remove(&active_key(&record.job.user_id), task_id)
                    .await?;
                tracing::info!(task_id, state = ?state, "job finished");
            }
            None => tracing::warn!(task_id, "finish on a job that is not active"),
        }
        Ok(())
    }

    /// 重启恢复：把停在 Active 的作业（上个进程执行到一半）放回 Pending 并重新排队，返回数量。
    /// 只应在没有其他进程共用同一存储时于启动阶段调用。
    pub async fn requeue_interrupted(&self) -> Result<usize, QueueError> {
        let mut requeued = 0;
        for (key, raw) in self.store.scan_prefix("job:").await? {
            let record: JobRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(key = %key, "Skipping unreadable job record: {}", e);
                    continue;
                }
            };
            if record.state != JobState::Active {
                continue;
            }
            let task_id = record.job.task_id.clone();
            let reset = update_json(self.store.as_ref(), &key, None, |mut r: JobRecord| {
                if r.state != JobState::Active {
                    return None;
                }
                r.state = JobState::Pending;
                r.started_at = None;
                Some(r)
            })
            .await?;
            if reset.is_some() {
                self.store.list_push(QUEUE_KEY, task_id.clone()).await?;
                tracing::info!(task_id = %task_id, "interrupted job requeued");
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    pub async fn active_tasks(&self, user_id: &str) -> Result<Vec<String>, QueueError> {
        Ok(self.store.set_members(&active_key(user_id)).await?)
    }

    /// 客户端断开：通知执行该任务的 Worker 取消审批等待，返回收到通知的 Worker 数
    pub async fn signal_disconnect(&self, task_id: &str) -> Result<usize, QueueError> {
        Ok(self
            .store
            .publish(&control_channel(task_id), "disconnect".to_string())
            .await?)
    }

    pub async fn subscribe_control(&self, task_id: &str) -> Result<Subscription, QueueError> {
        Ok(self.store.subscribe(&control_channel(task_id)).await?)
    }
}
