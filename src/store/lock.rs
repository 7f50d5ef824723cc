//! 分布式资源锁：串行化同一文件/文件夹 id 上的并发写操作
//!
//! 基于 set_nx + 过期键实现；持有者以随机 token 标识，只有持有者能释放。
//! 锁带 TTL，持有进程崩溃后自动失效。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{SharedStore, StoreError};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn lock_key(resource_id: &str) -> String {
    format!("lock:resource:{resource_id}")
}

/// 资源锁工厂
#[derive(Clone)]
pub struct ResourceLock {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
    wait: Duration,
}

impl ResourceLock {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration, wait: Duration) -> Self {
        Self { store, ttl, wait }
    }

    /// 获取锁；在 wait 时间内拿不到时返回 None
    pub async fn acquire(&self, resource_id: &str) -> Result<Option<LockGuard>, StoreError> {
        let key = lock_key(resource_id);
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;

        loop {
            if self
                .store
                .set_nx(&key, token.clone(), Some(self.ttl))
                .await?
            {
                return Ok(Some(LockGuard {
                    store: Arc::clone(&self.store),
                    key,
                    token,
                    released: false,
                }));
            }
            if Instant::now() >= deadline {
                tracing::warn!(resource = resource_id, "resource lock busy, giving up");
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}

/// 持有中的锁；显式 release，或在 Drop 时尽力异步释放
pub struct LockGuard {
    store: Arc<dyn SharedStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 释放锁；锁已过期并被他人获取时返回 false
    pub async fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        self.store.delete_if_eq(&self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                let _ = store.delete_if_eq(&key, &token).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn lock(store: &Arc<MemoryStore>, wait_ms: u64) -> ResourceLock {
        ResourceLock::new(
            Arc::clone(store) as Arc<dyn SharedStore>,
            Duration::from_secs(30),
            Duration::from_millis(wait_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_waits_until_release() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock(&store, 1000);

        let first = locks.acquire("folder-1").await.unwrap().expect("first acquire");
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("folder-1").await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(first.release().await.unwrap());

        let second = contender.await.unwrap().unwrap();
        assert!(second.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_wait() {
        let store = Arc::new(MemoryStore::new());
        let locks = lock(&store, 200);
        let _held = locks.acquire("file-9").await.unwrap().unwrap();
        assert!(locks.acquire("file-9").await.unwrap().is_none());
        // 不同资源互不影响
        assert!(locks.acquire("file-10").await.unwrap().is_some());
    }
}
