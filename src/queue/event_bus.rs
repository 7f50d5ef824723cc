//! 事件总线：按 taskId 的频道发布事件，进程内按频道引用计数订阅
//!
//! 同一频道的第一个订阅者建立上游订阅并启动转发任务，后续订阅者复用；
//! 最后一个退订时释放上游订阅。每个订阅者对每条事件恰好收到一次。
//! subscribe_until_finished 在 done / error 送达后自动退订，调用方无需保留句柄。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::queue::{QueueError, StreamEvent};
use crate::store::{SharedStore, Subscription};

pub type EventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

pub fn events_channel(task_id: &str) -> String {
    format!("task:{task_id}:events")
}

struct ChannelEntry {
    handlers: HashMap<u64, EventHandler>,
    forwarder: JoinHandle<()>,
}

type ChannelMap = Arc<Mutex<HashMap<String, ChannelEntry>>>;

pub struct EventBus {
    store: Arc<dyn SharedStore>,
    channels: ChannelMap,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// 发布事件，返回上游订阅数
    pub async fn publish(&self, task_id: &str, event: &StreamEvent) -> Result<usize, QueueError> {
        let payload = serde_json::to_string(event)?;
        Ok(self.store.publish(&events_channel(task_id), payload).await?)
    }

    /// 订阅某个任务的事件；返回的句柄调用 unsubscribe 或被丢弃时退订
    pub async fn subscribe(&self, task_id: &str, handler: EventHandler) -> Result<Unsubscribe, QueueError> {
        let channel = events_channel(task_id);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if self.try_attach(&channel, id, &handler)? {
            return Ok(self.handle(channel, id));
        }

        let upstream = self.store.subscribe(&channel).await?;

        let mut channels = self.channels.lock().map_err(|_| QueueError::Poisoned)?;
        match channels.get_mut(&channel) {
            // 并发的首个订阅者已建立上游订阅，丢弃本次的
            Some(entry) => {
                entry.handlers.insert(id, handler);
            }
            None => {
                let forwarder = tokio::spawn(forward(upstream, Arc::clone(&self.channels)));
                let mut handlers = HashMap::new();
                handlers.insert(id, handler);
                channels.insert(channel.clone(), ChannelEntry { handlers, forwarder });
                tracing::debug!(channel = %channel, "upstream subscription opened");
            }
        }
        drop(channels);
        Ok(self.handle(channel, id))
    }

    /// 订阅直到任务结束：处理完 done 或 error 后自动退订
    pub async fn subscribe_until_finished(
        &self,
        task_id: &str,
        handler: EventHandler,
    ) -> Result<(), QueueError> {
        let slot: Arc<Mutex<FinishSlot>> = Arc::new(Mutex::new(FinishSlot::default()));
        let wrapped: EventHandler = {
            let slot = Arc::clone(&slot);
            Arc::new(move |event: StreamEvent| {
                let terminal = matches!(event, StreamEvent::Done { .. } | StreamEvent::Error { .. });
                handler(event);
                if terminal {
                    if let Ok(mut slot) = slot.lock() {
                        slot.finished = true;
                        if let Some(sub) = slot.handle.take() {
                            sub.unsubscribe();
                        }
                    }
                }
            })
        };
        let sub = self.subscribe(task_id, wrapped).await?;

        let mut slot = slot.lock().map_err(|_| QueueError::Poisoned)?;
        // 终止事件可能在登记句柄之前就已送达
        if slot.finished {
            drop(slot);
            sub.unsubscribe();
        } else {
            slot.handle = Some(sub);
        }
        Ok(())
    }

    fn try_attach(&self, channel: &str, id: u64, handler: &EventHandler) -> Result<bool, QueueError> {
        let mut channels = self.channels.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(match channels.get_mut(channel) {
            Some(entry) => {
                entry.handlers.insert(id, Arc::clone(handler));
                true
            }
            None => false,
        })
    }

    fn handle(&self, channel: String, id: u64) -> Unsubscribe {
        Unsubscribe {
            channels: Arc::clone(&self.channels),
            channel,
            id,
            released: false,
        }
    }

    /// 当前持有上游订阅的频道数
    pub fn active_channels(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.channels
            .lock()
            .map(|c| {
                c.get(&events_channel(task_id))
                    .map(|e| e.handlers.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

async fn forward(mut upstream: Subscription, channels: ChannelMap) {
    while let Some(payload) = upstream.recv().await {
        let event: StreamEvent = match serde_json::from_str(&payload) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(channel = upstream.channel(), "Dropping malformed event: {}", e);
                continue;
            }
        };
        let handlers: Vec<EventHandler> = match channels.lock() {
            Ok(c) => c
                .get(upstream.channel())
                .map(|entry| entry.handlers.values().cloned().collect())
                .unwrap_or_default(),
            Err(_) => break,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }
}

#[derive(Default)]
struct FinishSlot {
    finished: bool,
    handle: Option<Unsubscribe>,
}

/// 退订句柄
pub struct Unsubscribe {
    channels: ChannelMap,
    channel: String,
    id: u64,
    released: bool,
}

impl Unsubscribe {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        let now_empty = match channels.get_mut(&self.channel) {
            Some(entry) => {
                entry.handlers.remove(&self.id);
                entry.handlers.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(entry) = channels.remove(&self.channel) {
                entry.forwarder.abort();
                tracing::debug!(channel = %self.channel, "upstream subscription released");
            }
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.release();
    }
}
