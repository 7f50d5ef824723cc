//! 能力网关：每次工具调用前的授权、限流、风险分级与审批交接
//!
//! 判定顺序：ACL → 限流 → 风险查表 → 危险操作创建审批。非危险调用的限流检查与计数是一次原子操作，
//! 危险调用只检查、批准后才计数。拒绝以 PermissionDecision 返回，
//! 由调用方作为文本回流给模型，不作为错误抛出。审批与限流状态都在共享存储里，多进程一致。

pub mod acl;
pub mod approval;
pub mod rate_limit;
pub mod risk;

pub use acl::{allowed_tools, check_acl, owner_of};
pub use approval::{ApprovalDecision, ApprovalRequest, ApprovalStatus, ApprovalStore};
pub use rate_limit::RateLimiter;
pub use risk::{classify, danger_reason, RiskLevel};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewaySection;
use crate::planning::AgentType;
use crate::store::{SharedStore, StoreError};

/// 授权判定
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionDecision {
    fn allow(risk: RiskLevel) -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            approval_id: None,
            risk: Some(risk),
            reason: None,
        }
    }

    fn deny(reason: String, risk: Option<RiskLevel>) -> Self {
        Self {
            allowed: false,
            requires_approval: false,
            approval_id: None,
            risk,
            reason: Some(reason),
        }
    }

    fn approval(id: String, reason: String) -> Self {
        Self {
            allowed: false,
            requires_approval: true,
            approval_id: Some(id),
            risk: Some(RiskLevel::Dangerous),
            reason: Some(reason),
        }
    }
}

pub struct CapabilityGateway {
    rate_limiter: RateLimiter,
    approvals: Arc<ApprovalStore>,
    sweep_interval: Duration,
}

impl CapabilityGateway {
    pub fn new(store: Arc<dyn SharedStore>, config: &GatewaySection) -> Self {
        Self {
            rate_limiter: RateLimiter::new(
                Arc::clone(&store),
                Duration::from_secs(config.rate_limit_window_secs),
                config.rate_limit_max,
            ),
            approvals: Arc::new(ApprovalStore::new(
                store,
                Duration::from_secs(config.approval_ttl_secs),
                Duration::from_secs(config.approval_retention_secs),
            )),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub async fn check_tool_permission(
        &self,
        agent: AgentType,
        tool_name: &str,
        user_id: &str,
        conversation_id: &str,
        args: &Value,
    ) -> Result<PermissionDecision, StoreError> {
        if let Err(reason) = check_acl(agent, tool_name) {
            tracing::info!(agent = %agent, tool = tool_name, "tool call denied by acl");
            return Ok(PermissionDecision::deny(reason, None));
        }

        let risk = classify(tool_name);
        let within_limit = if risk == RiskLevel::Dangerous {
            self.rate_limiter.check(user_id).await?
        } else {
            self.rate_limiter.try_acquire(user_id).await?
        };
        if !within_limit {
            tracing::warn!(user = user_id, tool = tool_name, "tool call denied by rate limit");
            return Ok(PermissionDecision::deny(
                "Rate limit exceeded: too many operations in the last minute. Try again shortly.".to_string(),
                None,
            ));
        }

        if risk == RiskLevel::Dangerous {
            let reason = danger_reason(tool_name, args);
            let req = self
                .approvals
                .create(user_id, conversation_id, tool_name, args.clone(), risk, reason.clone())
                .await?;
            return Ok(PermissionDecision::approval(req.id, reason));
        }

        Ok(PermissionDecision::allow(risk))
    }

    pub async fn wait_for_approval(
        &self,
        approval_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision, StoreError> {
        self.approvals.wait(approval_id, cancel).await
    }

    /// 外部裁决入口；重复或无效的调用返回 None。只有批准才计入限流
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        user_id: &str,
        approved: bool,
        modified_args: Option<Value>,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let resolved = self
            .approvals
            .resolve(approval_id, user_id, approved, modified_args)
            .await?;
        if let Some(req) = &resolved {
            if req.status == ApprovalStatus::Approved {
                self.rate_limiter.record(user_id).await?;
            }
        }
        Ok(resolved)
    }

    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.approvals).spawn_sweeper(self.sweep_interval, token)
    }
}
