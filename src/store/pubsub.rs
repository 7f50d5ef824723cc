//! 进程内发布订阅
//!
//! 每个订阅者一条无界 mpsc 通道，发布时逐个投递，慢消费者不会丢消息。
//! Subscription 被丢弃时从频道表移除自己，频道没有订阅者即删除条目。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use super::StoreError;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    channels: HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>,
}

type SharedInner = Arc<Mutex<HubInner>>;

/// 频道表；MemoryStore 与 SqliteStore 共用
#[derive(Clone, Default)]
pub struct ChannelHub {
    inner: SharedInner,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HubInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("channel table poisoned".into()))
    }

    pub fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
        Ok(Subscription {
            channel: channel.to_string(),
            rx,
            id,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// 投递给频道上的每个订阅者，返回投递成功的数量；接收端已关闭的顺手清掉
    pub fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let Some(subscribers) = inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
        let delivered = subscribers.len();
        if delivered == 0 {
            inner.channels.remove(channel);
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .map(|c| c.channels.get(channel).map(|s| s.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// 仍有订阅者的频道数
    pub fn channel_count(&self) -> usize {
        self.inner.lock().map(|c| c.channels.len()).unwrap_or(0)
    }
}

/// 频道订阅句柄；丢弃即取消订阅
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
    id: u64,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 接收下一条消息；存储被释放时返回 None
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let Ok(mut inner) = hub.lock() else {
            return;
        };
        let now_empty = match inner.channels.get_mut(&self.channel) {
            Some(subscribers) => {
                subscribers.remove(&self.id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.channels.remove(&self.channel);
        }
    }
}
