//! 审批表：危险操作的人工确认
//!
//! 审批记录存放在共享存储中（键 approval:{id}），状态迁移全部走 compare-and-set，
//! 成功迁移到终态后在频道 approval:{id} 上广播。等待方先订阅频道再读记录，
//! 因此 resolve 可以在任何进程中调用。终态记录在 TTL 之外再保留一段时间，迟到的 resolve 看到终态即为空操作。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::gateway::RiskLevel;
use crate::store::{get_json, set_json, update_json, SharedStore, StoreError};

const PENDING_INDEX: &str = "approvals:pending";
/// tokio interval 不接受零周期
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

fn approval_key(id: &str) -> String {
    format!("approval:{id}")
}

fn approval_channel(id: &str) -> String {
    format!("approval:{id}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub args: Value,
    pub risk: RiskLevel,
    pub reason: String,
    pub status: ApprovalStatus,
    /// 毫秒时间戳
    pub created_at: i64,
    #[serde(default)]
    pub resolved_at: Option<i64>,
    pub ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
}

impl ApprovalRequest {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.created_at >= (self.ttl_seconds as i64) * 1000
    }

    /// 距离过期的剩余时间
    pub fn remaining(&self, now_ms: i64) -> Duration {
        let deadline = self.created_at + (self.ttl_seconds as i64) * 1000;
        Duration::from_millis((deadline - now_ms).max(0) as u64)
    }
}

/// 等待结果
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub modified_args: Option<Value>,
    pub status: ApprovalStatus,
}

impl ApprovalDecision {
    fn from_request(req: &ApprovalRequest) -> Self {
        Self {
            approved: req.status == ApprovalStatus::Approved,
            modified_args: req.modified_args.clone(),
            status: req.status,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ApprovalStore {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    retention: Duration,
}

impl ApprovalStore {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration, retention: Duration) -> Self {
        Self {
            store,
            ttl,
            retention,
        }
    }

    fn record_ttl(&self) -> Option<Duration> {
        Some(self.ttl + self.retention)
    }

    pub async fn create(
        &self,
        user_id: &str,
        conversation_id: &str,
        tool_name: &str,
        args: Value,
        risk: RiskLevel,
        reason: String,
    ) -> Result<ApprovalRequest, StoreError> {
        let req = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
            risk,
            reason,
            status: ApprovalStatus::Pending,
            created_at: now_ms(),
            resolved_at: None,
            ttl_seconds: self.ttl.as_secs(),
            modified_args: None,
        };
        set_json(self.store.as_ref(), &approval_key(&req.id), &req, self.record_ttl()).await?;
        self.store.set_add(PENDING_INDEX, &req.id).await?;
        tracing::info!(approval_id = %req.id, tool = tool_name, user = user_id, "approval requested");
        Ok(req)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        get_json(self.store.as_ref(), &approval_key(id)).await
    }

    pub async fn pending_ids(&self) -> Result<Vec<String>, StoreError> {
        self.store.set_members(PENDING_INDEX).await
    }

    /// 只对 Pending 记录生效的状态迁移；迁移成功且进入终态时移出索引并广播
    async fn transition<F>(&self, id: &str, mut f: F) -> Result<Option<ApprovalRequest>, StoreError>
    where
        F: FnMut(ApprovalRequest) -> Option<ApprovalRequest>,
    {
        let updated = update_json(self.store.as_ref(), &approval_key(id), self.record_ttl(), |req: ApprovalRequest| {
            if req.status.is_terminal() {
                return None;
            }
            f(req)
        })
        .await?;

        if let Some(req) = &updated {
            if req.status.is_terminal() {
                self.store.set_remove(PENDING_INDEX, id).await?;
                let payload = serde_json::to_string(&req.status)?;
                let receivers = self.store.publish(&approval_channel(id), payload).await?;
                tracing::info!(approval_id = id, status = ?req.status, receivers, "approval resolved");
            }
        }
        Ok(updated)
    }

    /// 用户裁决。非属主、非 Pending、已过期时返回 None（过期的会顺带置为 Expired）
    pub async fn resolve(
        &self,
        id: &str,
        user_id: &str,
        approved: bool,
        modified_args: Option<Value>,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let now = now_ms();
        let mut owner_mismatch = false;
        let updated = self
            .transition(id, |mut req| {
                if req.user_id != user_id {
                    owner_mismatch = true;
                    return None;
                }
                req.resolved_at = Some(now);
                if req.is_expired(now) {
                    req.status = ApprovalStatus::Expired;
                } else if approved {
                    req.status = ApprovalStatus::Approved;
                    req.modified_args = modified_args.clone();
                } else {
                    req.status = ApprovalStatus::Rejected;
                }
                Some(req)
            })
            .await?;

        if owner_mismatch {
            tracing::warn!(approval_id = id, user = user_id, "approval resolve by non-owner ignored");
        }
        Ok(updated.filter(|req| req.status != ApprovalStatus::Expired))
    }

    /// 强制过期（超时、取消、清扫）
    pub async fn expire(&self, id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        let now = now_ms();
        self.transition(id, |mut req| {
            req.status = ApprovalStatus::Expired;
            req.resolved_at = Some(now);
            Some(req)
        })
        .await
    }

    /// 挂起直到裁决、取消或超时；三条路径中只有先到的一条生效
    pub async fn wait(&self, id: &str, cancel: &CancellationToken) -> Result<ApprovalDecision, StoreError> {
        let channel = approval_channel(id);
        // 先订阅再读，避免错过读与订阅之间的广播
        let mut sub = self.store.subscribe(&channel).await?;
        loop {
            let Some(req) = self.get(id).await? else {
                return Ok(ApprovalDecision {
                    approved: false,
                    modified_args: None,
                    status: ApprovalStatus::Expired,
                });
            };
            if req.status.is_terminal() {
                return Ok(ApprovalDecision::from_request(&req));
            }
            let now = now_ms();
            if req.is_expired(now) {
                self.expire(id).await?;
                continue;
            }

            let channel_closed = tokio::select! {
                msg = sub.recv() => msg.is_none(),
                _ = cancel.cancelled() => {
                    tracing::info!(approval_id = id, "approval wait cancelled");
                    self.expire(id).await?;
                    false
                }
                _ = tokio::time::sleep(req.remaining(now)) => {
                    tracing::info!(approval_id = id, "approval wait timed out");
                    self.expire(id).await?;
                    false
                }
            };
            if channel_closed {
                sub = self.store.subscribe(&channel).await?;
            }
        }
    }

    /// 扫描 Pending 索引，过期的强制置为 Expired，返回处理的数量
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let mut expired = 0;
        for id in self.pending_ids().await? {
            match self.get(&id).await? {
                Some(req) if req.status == ApprovalStatus::Pending => {
                    if req.is_expired(now) && self.expire(&id).await?.is_some() {
                        expired += 1;
                    }
                }
                _ => {
                    self.store.set_remove(PENDING_INDEX, &id).await?;
                }
            }
        }
        if expired > 0 {
            tracing::info!(expired, "approval sweep expired stale requests");
        }
        Ok(expired)
    }

    /// 周期清扫任务，token 取消后退出；周期不足 1 秒按 1 秒算
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_expired().await {
                            tracing::warn!("Approval sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("approval sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn approvals(ttl_secs: u64) -> Arc<ApprovalStore> {
        Arc::new(ApprovalStore::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(ttl_secs),
            Duration::from_secs(3600),
        ))
    }

    async fn create(store: &ApprovalStore) -> ApprovalRequest {
        store
            .create(
                "owner",
                "conv-1",
                "delete_folder",
                json!({"folderId": "fd-1"}),
                RiskLevel::Dangerous,
                "delete".into(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let store = approvals(300);
        let req = create(&store).await;
        let resolved = store.resolve(&req.id, "owner", true, None).await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(resolved.resolved_at.is_some());

        assert!(store.resolve(&req.id, "owner", true, None).await.unwrap().is_none());
        assert!(store.resolve(&req.id, "owner", false, None).await.unwrap().is_none());
        assert!(store.expire(&req.id).await.unwrap().is_none());
        assert_eq!(store.get(&req.id).await.unwrap().unwrap().status, ApprovalStatus::Approved);
        assert!(store.pending_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_owner_cannot_resolve() {
        let store = approvals(300);
        let req = create(&store).await;
        assert!(store.resolve(&req.id, "mallory", true, None).await.unwrap().is_none());
        assert_eq!(store.get(&req.id).await.unwrap().unwrap().status, ApprovalStatus::Pending);
        assert!(store.resolve("missing", "owner", true, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_after_ttl_expires_instead() {
        let store = approvals(0);
        let req = create(&store).await;
        assert!(store.resolve(&req.id, "owner", true, None).await.unwrap().is_none());
        assert_eq!(store.get(&req.id).await.unwrap().unwrap().status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn test_wait_receives_resolution_with_modified_args() {
        let store = approvals(300);
        let req = create(&store).await;
        let waiter = {
            let store = Arc::clone(&store);
            let id = req.id.clone();
            tokio::spawn(async move { store.wait(&id, &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;
        store
            .resolve(&req.id, "owner", true, Some(json!({"folderId": "fd-2"})))
            .await
            .unwrap();
        let decision = waiter.await.unwrap().unwrap();
        assert!(decision.approved);
        assert_eq!(decision.modified_args, Some(json!({"folderId": "fd-2"})));
    }

    #[tokio::test]
    async fn test_wait_cancel_expires_request() {
        let store = approvals(300);
        let req = create(&store).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let decision = store.wait(&req.id, &cancel).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.status, ApprovalStatus::Expired);
        // 取消之后的 resolve 是空操作
        assert!(store.resolve(&req.id, "owner", true, None).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let store = approvals(5);
        let req = create(&store).await;
        let decision = store.wait(&req.id, &CancellationToken::new()).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.status, ApprovalStatus::Expired);
    }

    #[tokio::test]
    async fn test_sweep_wakes_waiter() {
        let store = approvals(0);
        let req = create(&store).await;
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        let decision = store.wait(&req.id, &CancellationToken::new()).await.unwrap();
        assert_eq!(decision.status, ApprovalStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_wakes_blocked_waiter() {
        let store = approvals(1);
        let req = create(&store).await;
        let started = tokio::time::Instant::now();
        let waiter = {
            let store = Arc::clone(&store);
            let id = req.id.clone();
            tokio::spawn(async move { store.wait(&id, &CancellationToken::new()).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!waiter.is_finished());

        // 墙钟越过 TTL，而 tokio 时钟停住，等待方自己的计时器不会触发
        std::thread::sleep(Duration::from_millis(1100));
        let token = CancellationToken::new();
        let sweeper = Arc::clone(&store).spawn_sweeper(Duration::from_secs(60), token.clone());

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision.status, ApprovalStatus::Expired);
        assert!(!decision.approved);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(store.pending_ids().await.unwrap().is_empty());

        token.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_does_not_panic() {
        let store = approvals(300);
        let token = CancellationToken::new();
        let sweeper = Arc::clone(&store).spawn_sweeper(Duration::ZERO, token.clone());
        tokio::task::yield_now().await;
        token.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_waits_leave_no_channels() {
        let shared = Arc::new(MemoryStore::new());
        let store = Arc::new(ApprovalStore::new(
            shared.clone(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));
        for _ in 0..100 {
            let req = create(&store).await;
            let waiter = {
                let store = Arc::clone(&store);
                let id = req.id.clone();
                tokio::spawn(async move { store.wait(&id, &CancellationToken::new()).await })
            };
            tokio::task::yield_now().await;
            store.resolve(&req.id, "owner", true, None).await.unwrap();
            assert!(waiter.await.unwrap().unwrap().approved);
        }
        assert_eq!(shared.channel_count(), 0);
    }
}
