//! 异步任务队列与事件总线
//!
//! 传输层可见的接口：enqueue / get_status / subscribe（返回退订句柄）/ signal_disconnect。

pub mod event_bus;
pub mod events;
pub mod task_queue;
pub mod worker;

pub use event_bus::{events_channel, EventBus, EventHandler, Unsubscribe};
pub use events::{EventSink, StreamEvent};
pub use task_queue::{control_channel, ChatJob, JobRecord, JobState, TaskQueue, TaskStatus};
pub use worker::{JobContext, JobProcessor, WorkerPool};

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("subscription table poisoned")]
    Poisoned,
}
