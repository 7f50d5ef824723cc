//! 按用户限流：共享存储中的过期计数键，窗口从首次计数开始

use std::sync::Arc;
use std::time::Duration;

use crate::store::{SharedStore, StoreError};

fn rate_key(user_id: &str) -> String {
    format!("ratelimit:{user_id}")
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    window: Duration,
    max: u64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, window: Duration, max: u64) -> Self {
        Self { store, window, max }
    }

    /// 当前窗口内已计数的操作数
    pub async fn current(&self, user_id: &str) -> Result<u64, StoreError> {
        let key = rate_key(user_id);
        match self.store.get(&key).await? {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| StoreError::NotAnInteger { key }),
            None => Ok(0),
        }
    }

    /// 是否还能再执行一次（不计数）
    pub async fn check(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.current(user_id).await? < self.max)
    }

    /// 检查并计数合为一步：窗口未满时计数并返回 true，已满返回 false 且不计数
    pub async fn try_acquire(&self, user_id: &str) -> Result<bool, StoreError> {
        let counted = self
            .store
            .incr_if_below(&rate_key(user_id), self.max, Some(self.window))
            .await?;
        Ok(counted.is_some())
    }

    /// 计数一次，返回窗口内累计值
    pub async fn record(&self, user_id: &str) -> Result<u64, StoreError> {
        self.store.incr(&rate_key(user_id), Some(self.window)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), Duration::from_secs(60), 3);
        for _ in 0..3 {
            assert!(limiter.check("u1").await.unwrap());
            limiter.record("u1").await.unwrap();
        }
        assert!(!limiter.check("u1").await.unwrap());
        assert!(limiter.check("u2").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("u1").await.unwrap());
        assert_eq!(limiter.record("u1").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_stops_at_max() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), Duration::from_secs(60), 2);
        assert!(limiter.try_acquire("u1").await.unwrap());
        assert!(limiter.try_acquire("u1").await.unwrap());
        assert!(!limiter.try_acquire("u1").await.unwrap());
        assert_eq!(limiter.current("u1").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.try_acquire("u1").await.unwrap());
        assert_eq!(limiter.current("u1").await.unwrap(), 1);
    }
}
