//! 流式事件：执行过程中产生的进度事件，按 taskId 发布到事件总线

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::gateway::ApprovalStatus;
use crate::planning::{AgentType, StepStatus, TaskPlan};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// 是否拆解为计划，以及单步执行时选用的 Agent
    RouteDecision {
        planned: bool,
        agent: Option<AgentType>,
        reason: String,
    },
    PlanAnnounced {
        plan: TaskPlan,
    },
    StepUpdate {
        step_id: u32,
        title: String,
        status: StepStatus,
        detail: Option<String>,
    },
    ToolCallStart {
        step_id: Option<u32>,
        tool: String,
        args: Value,
    },
    ToolCallEnd {
        step_id: Option<u32>,
        tool: String,
        is_error: bool,
        preview: String,
    },
    ApprovalNeeded {
        approval_id: String,
        tool: String,
        args: Value,
        reason: String,
    },
    ApprovalResolved {
        approval_id: String,
        approved: bool,
        status: ApprovalStatus,
    },
    Content {
        text: String,
    },
    Done {
        task_id: String,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::RouteDecision { .. } => "route_decision",
            StreamEvent::PlanAnnounced { .. } => "plan_announced",
            StreamEvent::StepUpdate { .. } => "step_update",
            StreamEvent::ToolCallStart { .. } => "tool_call_start",
            StreamEvent::ToolCallEnd { .. } => "tool_call_end",
            StreamEvent::ApprovalNeeded { .. } => "approval_needed",
            StreamEvent::ApprovalResolved { .. } => "approval_resolved",
            StreamEvent::Content { .. } => "content",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// 事件出口：执行代码只管 emit，由 Worker 负责按顺序转发到总线
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 丢弃所有事件
    pub fn noop() -> Self {
        Self::channel().0
    }

    /// 接收端已关闭时静默丢弃
    pub fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let ev = StreamEvent::StepUpdate {
            step_id: 2,
            title: "Summarize".into(),
            status: StepStatus::InProgress,
            detail: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "step_update");
        assert_eq!(json["stepId"], 2);
        assert_eq!(json["status"], "in-progress");
        let back: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.kind(), "step_update");
    }

    #[tokio::test]
    async fn test_sink_preserves_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(StreamEvent::Content { text: "a".into() });
        sink.clone().emit(StreamEvent::Done { task_id: "t".into() });
        drop(sink);
        assert_eq!(rx.recv().await.unwrap().kind(), "content");
        assert_eq!(rx.recv().await.unwrap().kind(), "done");
        assert!(rx.recv().await.is_none());
        EventSink::noop().emit(StreamEvent::Content { text: "dropped".into() });
    }
}
