//! 单进程 SharedStore 实现
//!
//! 键过期按 tokio 时钟判断（测试中可用暂停时钟推进），访问时惰性清理；
//! 发布订阅走 ChannelHub，无订阅者时发布即丢弃。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ChannelHub, SharedStore, StoreError, Subscription};

enum Value {
    Str(String),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn string(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Str(value),
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

fn purge_expired(map: &mut HashMap<String, Entry>, key: &str) {
    if map.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        map.remove(key);
    }
}

/// 单进程共享存储
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    hub: ChannelHub,
    list_notify: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hub: ChannelHub::new(),
            list_notify: Notify::new(),
        }
    }

    /// 当前频道上的订阅者数量
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub.subscriber_count(channel)
    }

    /// 仍有订阅者的频道数
    pub fn channel_count(&self) -> usize {
        self.hub.channel_count()
    }

    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> R,
    ) -> Result<R, StoreError> {
        let mut map = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("entry table poisoned".into()))?;
        Ok(f(&mut map))
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            let popped = match m.get_mut(key) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => list.pop_front(),
                Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
                None => None,
            };
            if matches!(m.get(key), Some(Entry { value: Value::List(l), .. }) if l.is_empty()) {
                m.remove(key);
            }
            Ok(popped)
        })?
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            match m.get(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => Ok(Some(s.clone())),
                Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
                None => Ok(None),
            }
        })?
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_entries(|m| {
            m.insert(key.to_string(), Entry::string(value, ttl));
        })
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            if m.contains_key(key) {
                return false;
            }
            m.insert(key.to_string(), Entry::string(value, ttl));
            true
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            match m.get(key) {
                Some(Entry {
                    value: Value::Str(current),
                    ..
                }) if current == expected => {
                    m.insert(key.to_string(), Entry::string(value, ttl));
                    true
                }
                _ => false,
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            m.remove(key).is_some()
        })
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            match m.get(key) {
                Some(Entry {
                    value: Value::Str(current),
                    ..
                }) if current == expected => {
                    m.remove(key);
                    true
                }
                _ => false,
            }
        })
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<u64, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            match m.get_mut(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => {
                    let n: u64 = s
                        .parse()
                        .map_err(|_| StoreError::NotAnInteger { key: key.to_string() })?;
                    *s = (n + 1).to_string();
                    Ok(n + 1)
                }
                Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
                None => {
                    m.insert(key.to_string(), Entry::string("1".to_string(), ttl_on_create));
                    Ok(1)
                }
            }
        })?
    }

    async fn incr_if_below(
        &self,
        key: &str,
        max: u64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            match m.get_mut(key) {
                Some(Entry {
                    value: Value::Str(s),
                    ..
                }) => {
                    let n: u64 = s
                        .parse()
                        .map_err(|_| StoreError::NotAnInteger { key: key.to_string() })?;
                    if n >= max {
                        return Ok(None);
                    }
                    *s = (n + 1).to_string();
                    Ok(Some(n + 1))
                }
                Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
                None if max == 0 => Ok(None),
                None => {
                    m.insert(key.to_string(), Entry::string("1".to_string(), ttl_on_create));
                    Ok(Some(1))
                }
            }
        })?
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.with_entries(|m| {
            let now = Instant::now();
            m.retain(|_, e| !e.is_expired(now));
            m.iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .filter_map(|(k, e)| match &e.value {
                    Value::Str(s) => Some((k.clone(), s.clone())),
                    _ => None,
                })
                .collect()
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(set) => Ok(set.insert(member.to_string())),
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            }
        })?
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            let (removed, now_empty) = match m.get_mut(key) {
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => (set.remove(member), set.is_empty()),
                Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
                None => (false, false),
            };
            if now_empty {
                m.remove(key);
            }
            Ok(removed)
        })?
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            match m.get(key) {
                Some(Entry {
                    value: Value::Set(set),
                    ..
                }) => {
                    let mut members: Vec<String> = set.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
                None => Ok(Vec::new()),
            }
        })?
    }

    async fn list_push(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.with_entries(|m| {
            purge_expired(m, key);
            let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => {
                    list.push_back(value);
                    Ok(())
                }
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            }
        })??;
        self.list_notify.notify_waiters();
        Ok(())
    }

    async fn list_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // 先登记等待再检查列表，避免检查与等待之间的 push 被漏掉
            let notified = self.list_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(key);
            }
        }
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        self.hub.publish(channel, payload)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.hub.subscribe(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_key_expires_on_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set("approval:1", "pending".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("approval:1").await.unwrap().as_deref(), Some("pending"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("approval:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_and_compare_and_set() {
        let store = MemoryStore::new();
        assert!(store.set_nx("job:a", "v1".into(), None).await.unwrap());
        assert!(!store.set_nx("job:a", "v2".into(), None).await.unwrap());

        assert!(!store.compare_and_set("job:a", "stale", "v3".into(), None).await.unwrap());
        assert!(store.compare_and_set("job:a", "v1", "v3".into(), None).await.unwrap());
        assert_eq!(store.get("job:a").await.unwrap().as_deref(), Some("v3"));

        assert!(!store.delete_if_eq("job:a", "v1").await.unwrap());
        assert!(store.delete_if_eq("job:a", "v3").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_keeps_window_from_first_write() {
        let store = MemoryStore::new();
        let window = Some(Duration::from_secs(60));
        assert_eq!(store.incr("rate:u1", window).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.incr("rate:u1", window).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(31)).await;
        // 窗口从首次写入算起，61 秒后重新计数
        assert_eq!(store.incr("rate:u1", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let popper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.list_pop("queue", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        store.list_push("queue", "task-1".into()).await.unwrap();
        assert_eq!(popper.await.unwrap().unwrap().as_deref(), Some("task-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_pop_times_out() {
        let store = MemoryStore::new();
        let popped = store.list_pop("queue", Duration::from_millis(200)).await.unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", "nobody".into()).await.unwrap(), 0);

        let mut a = store.subscribe("ch").await.unwrap();
        let mut b = store.subscribe("ch").await.unwrap();
        assert_eq!(store.subscriber_count("ch"), 2);
        assert_eq!(store.publish("ch", "hello".into()).await.unwrap(), 2);
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));

        drop(a);
        drop(b);
        assert_eq!(store.subscriber_count("ch"), 0);
        assert_eq!(store.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_if_below_stops_at_max() {
        let store = MemoryStore::new();
        let window = Some(Duration::from_secs(60));
        assert_eq!(store.incr_if_below("rate:u1", 2, window).await.unwrap(), Some(1));
        assert_eq!(store.incr_if_below("rate:u1", 2, window).await.unwrap(), Some(2));
        assert_eq!(store.incr_if_below("rate:u1", 2, window).await.unwrap(), None);
        assert_eq!(store.get("rate:u1").await.unwrap().as_deref(), Some("2"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.incr_if_below("rate:u1", 2, window).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_sets_and_scan() {
        let store = MemoryStore::new();
        assert!(store.set_add("user:u1:active", "t1").await.unwrap());
        assert!(!store.set_add("user:u1:active", "t1").await.unwrap());
        store.set_add("user:u1:active", "t2").await.unwrap();
        assert_eq!(store.set_members("user:u1:active").await.unwrap(), vec!["t1", "t2"]);
        assert!(store.set_remove("user:u1:active", "t1").await.unwrap());

        store.set("approval:a", "1".into(), None).await.unwrap();
        store.set("approval:b", "2".into(), None).await.unwrap();
        store.set("job:c", "3".into(), None).await.unwrap();
        let mut found = store.scan_prefix("approval:").await.unwrap();
        found.sort();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, "approval:a");

        // 集合键不能当字符串读
        assert!(matches!(
            store.get("user:u1:active").await,
            Err(StoreError::WrongType { .. })
        ));
    }
}
