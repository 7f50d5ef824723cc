//! 共享存储：任务队列、事件总线、审批表、限流计数、资源锁共用的 KV + 发布订阅抽象
//!
//! 所有跨进程可见的状态都经由 SharedStore；进程内只保留订阅句柄等瞬态对象。
//! MemoryStore 为单进程实现（过期时间按 tokio 时钟计算）；SqliteStore 把键值、集合、列表落盘，
//! 进程重启后排队作业、审批记录、去重键仍在。网络化实现只需实现同一 trait。

pub mod lock;
pub mod memory;
pub mod pubsub;
pub mod sqlite;

pub use lock::{LockGuard, ResourceLock};
pub use memory::MemoryStore;
pub use pubsub::{ChannelHub, Subscription};
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("key {key} holds a different value type")]
    WrongType { key: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// 共享存储 trait（语义对齐常见的 KV 存储：过期键、原子自增、集合、阻塞弹出、发布订阅）
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 写入；ttl 为 None 表示永不过期
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// 仅当键不存在时写入，返回是否写入成功
    async fn set_nx(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool, StoreError>;

    /// 仅当当前值等于 expected 时替换，返回是否替换成功
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// 仅当当前值等于 expected 时删除
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// 原子自增；键不存在时从 0 开始并设置 ttl_on_create，已存在时保留原过期时间
    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<u64, StoreError>;

    /// 原子地「小于 max 才自增」：成功返回新值，已达上限返回 None 且不改动计数
    async fn incr_if_below(
        &self,
        key: &str,
        max: u64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Option<u64>, StoreError>;

    /// 列出前缀匹配的字符串键值
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// 追加到列表尾部
    async fn list_push(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// 从列表头部弹出，列表为空时最多阻塞 timeout
    async fn list_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    /// 发布消息，返回收到消息的订阅者数量
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// 读取并反序列化 JSON 值
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// 序列化为 JSON 后写入
pub async fn set_json<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    store.set(key, serde_json::to_string(value)?, ttl).await
}

/// 以 compare-and-set 方式更新 JSON 记录。
///
/// `f` 返回 None 表示放弃更新（例如状态已是终态）；并发修改导致 CAS 失败时重读重试。
/// 返回 Ok(Some(新值)) 表示本次调用完成了更新。
pub async fn update_json<T, F>(
    store: &dyn SharedStore,
    key: &str,
    ttl: Option<Duration>,
    mut f: F,
) -> Result<Option<T>, StoreError>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(T) -> Option<T>,
{
    const MAX_ATTEMPTS: usize = 16;
    for _ in 0..MAX_ATTEMPTS {
        let Some(raw) = store.get(key).await? else {
            return Ok(None);
        };
        let current: T = serde_json::from_str(&raw)?;
        let Some(next) = f(current) else {
            return Ok(None);
        };
        let encoded = serde_json::to_string(&next)?;
        if store.compare_and_set(key, &raw, encoded, ttl).await? {
            return Ok(Some(next));
        }
    }
    Err(StoreError::Unavailable(format!(
        "gave up updating {key} after {MAX_ATTEMPTS} conflicting writes"
    )))
}
