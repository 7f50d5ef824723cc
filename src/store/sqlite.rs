//! SQLite 持久化的 SharedStore
//!
//! 键值、集合、列表分表存放，过期时间为墙钟毫秒（重启后依旧有效）；读改写操作放在 IMMEDIATE 事务里，
//! 多个进程打开同一文件时也保持原子。发布订阅只在进程内（ChannelHub），
//! 阻塞弹出除了本进程 push 的唤醒外还会定期轮询，其他进程写入的作业也能被取走。

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ChannelHub, SharedStore, StoreError, Subscription};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);
CREATE TABLE IF NOT EXISTS set_members (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);
CREATE TABLE IF NOT EXISTS list_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_list_items_key ON list_items(key, id);
";

/// 其他进程 push 的最长发现延迟
const LIST_POLL_INTERVAL: Duration = Duration::from_millis(250);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now_ms().saturating_add(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)))
}

fn purge_expired(conn: &Connection, key: &str, now: i64) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now],
    )?;
    Ok(())
}

fn read_counter(conn: &Connection, key: &str) -> Result<Option<u64>, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    raw.map(|v| {
        v.parse::<u64>()
            .map_err(|_| StoreError::NotAnInteger { key: key.to_string() })
    })
    .transpose()
}

/// 计数 +1；键不存在时以 ttl_on_create 新建，已存在时保留原过期时间
fn bump_counter(
    conn: &Connection,
    key: &str,
    current: Option<u64>,
    ttl_on_create: Option<Duration>,
) -> Result<u64, StoreError> {
    match current {
        Some(n) => {
            conn.execute(
                "UPDATE kv SET value = ?2 WHERE key = ?1",
                params![key, (n + 1).to_string()],
            )?;
            Ok(n + 1)
        }
        None => {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, '1', ?2)",
                params![key, expiry(ttl_on_create)],
            )?;
            Ok(1)
        }
    }
}

/// SQLite 共享存储
pub struct SqliteStore {
    conn: Mutex<Connection>,
    hub: ChannelHub,
    list_notify: Notify,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件，父目录不存在时一并创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create store dir {}: {}", parent.display(), e))
            })?;
        }
        let store = Self::from_connection(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hub: ChannelHub::new(),
            list_notify: Notify::new(),
        })
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))?;
        f(&mut conn)
    }

    /// 在 IMMEDIATE 事务中执行读改写；f 出错时事务回滚
    fn in_tx<R>(&self, f: impl FnOnce(&Connection, i64) -> Result<R, StoreError>) -> Result<R, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx, now_ms())?;
            tx.commit()?;
            Ok(out)
        })
    }

    fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.in_tx(|conn, _| {
            let head: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, value FROM list_items WHERE key = ?1 ORDER BY id LIMIT 1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match head {
                Some((id, value)) => {
                    conn.execute("DELETE FROM list_items WHERE id = ?1", params![id])?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
    }

    /// 当前频道上的订阅者数量（仅本进程）
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub.subscriber_count(channel)
    }
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now_ms()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(ttl)],
            )?;
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool, StoreError> {
        self.in_tx(|conn, now| {
            purge_expired(conn, key, now)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(ttl)],
            )?;
            Ok(inserted == 1)
        })
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE kv SET value = ?3, expires_at = ?4
                 WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?5)",
                params![key, expected, value, expiry(ttl), now_ms()],
            )?;
            Ok(updated == 1)
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.in_tx(|conn, now| {
            purge_expired(conn, key, now)?;
            Ok(conn.execute("DELETE FROM kv WHERE key = ?1", params![key])? > 0)
        })
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, expected, now_ms()],
            )?;
            Ok(deleted > 0)
        })
    }

    async fn incr(&self, key: &str, ttl_on_create: Option<Duration>) -> Result<u64, StoreError> {
        self.in_tx(|conn, now| {
            purge_expired(conn, key, now)?;
            let current = read_counter(conn, key)?;
            bump_counter(conn, key, current, ttl_on_create)
        })
    }

    async fn incr_if_below(
        &self,
        key: &str,
        max: u64,
        ttl_on_create: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        self.in_tx(|conn, now| {
            purge_expired(conn, key, now)?;
            let current = read_counter(conn, key)?;
            if current.unwrap_or(0) >= max {
                return Ok(None);
            }
            bump_counter(conn, key, current, ttl_on_create).map(Some)
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_ms()],
            )?;
            let mut stmt =
                conn.prepare("SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1")?;
            let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let found = rows.collect::<Result<Vec<(String, String)>, _>>()?;
            Ok(found)
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO set_members (key, member) VALUES (?1, ?2)",
                params![key, member],
            )?;
            Ok(inserted == 1)
        })
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM set_members WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            Ok(removed > 0)
        })
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT member FROM set_members WHERE key = ?1 ORDER BY member")?;
            let rows = stmt.query_map(params![key], |row| row.get(0))?;
            let members = rows.collect::<Result<Vec<String>, _>>()?;
            Ok(members)
        })
    }

    async fn list_push(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO list_items (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })?;
        self.list_notify.notify_waiters();
        Ok(())
    }

    async fn list_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.list_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key)? {
                return Ok(Some(value));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = deadline.min(now + LIST_POLL_INTERVAL);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
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
    use crate::gateway::{ApprovalStatus, ApprovalStore, RiskLevel};
    use crate::queue::{ChatJob, TaskQueue, TaskStatus};
    use serde_json::json;
    use std::sync::Arc;

    fn job(task_id: &str) -> ChatJob {
        ChatJob {
            task_id: task_id.into(),
            user_id: "u1".into(),
            message: "delete the folder Old Reports".into(),
            conversation_id: "c1".into(),
            context: None,
        }
    }

    #[tokio::test]
    async fn test_queued_job_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("drivebee.db");

        {
            let store = Arc::new(SqliteStore::open(&path).unwrap());
            let queue = TaskQueue::new(store, Duration::from_secs(3600));
            queue.enqueue(job("t1")).await.unwrap();
            queue.enqueue(job("t2")).await.unwrap();
        }

        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let queue = TaskQueue::new(store, Duration::from_secs(3600));
        assert_eq!(queue.get_status("t1").await.unwrap(), TaskStatus::Pending);
        // 去重键同样保留
        queue.enqueue(job("t1")).await.unwrap();

        let first = queue.next_job(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.job.task_id, "t1");
        let second = queue.next_job(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.job.task_id, "t2");
        assert!(queue.next_job(Duration::from_millis(50)).await.unwrap().is_none());
        assert_eq!(queue.get_status("t1").await.unwrap(), TaskStatus::Active);
        assert_eq!(queue.active_tasks("u1").await.unwrap(), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_pending_approval_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drivebee.db");
        let ttl = Duration::from_secs(300);
        let retention = Duration::from_secs(3600);

        let id = {
            let approvals = ApprovalStore::new(Arc::new(SqliteStore::open(&path).unwrap()), ttl, retention);
            approvals
                .create(
                    "u1",
                    "c1",
                    "delete_folder",
                    json!({"folderId": "fold-9"}),
                    RiskLevel::Dangerous,
                    "Delete folder fold-9".into(),
                )
                .await
                .unwrap()
                .id
        };

        let approvals = ApprovalStore::new(Arc::new(SqliteStore::open(&path).unwrap()), ttl, retention);
        let req = approvals.get(&id).await.unwrap().unwrap();
        assert_eq!(req.status, ApprovalStatus::Pending);
        let resolved = approvals.resolve(&id, "u1", true, None).await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_expiry_and_compare_and_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set("lock:f1", "token-a".into(), Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert!(!store.set_nx("lock:f1", "token-b".into(), None).await.unwrap());
        assert!(!store.compare_and_set("lock:f1", "token-x", "token-c".into(), None).await.unwrap());
        assert!(store
            .compare_and_set("lock:f1", "token-a", "token-c".into(), Some(Duration::from_millis(40)))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("lock:f1").await.unwrap(), None);
        assert!(!store.delete_if_eq("lock:f1", "token-c").await.unwrap());
        assert!(store.set_nx("lock:f1", "token-b".into(), None).await.unwrap());
        assert!(store.delete("lock:f1").await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_and_sets() {
        let store = SqliteStore::open_in_memory().unwrap();
        let window = Some(Duration::from_secs(60));
        assert_eq!(store.incr("ratelimit:u1", window).await.unwrap(), 1);
        assert_eq!(store.incr_if_below("ratelimit:u1", 2, window).await.unwrap(), Some(2));
        assert_eq!(store.incr_if_below("ratelimit:u1", 2, window).await.unwrap(), None);
        assert_eq!(store.get("ratelimit:u1").await.unwrap().as_deref(), Some("2"));

        store.set("ratelimit:u2", "many".into(), None).await.unwrap();
        assert!(matches!(
            store.incr("ratelimit:u2", window).await,
            Err(StoreError::NotAnInteger { .. })
        ));

        assert!(store.set_add("user:u1:active_tasks", "t2").await.unwrap());
        assert!(!store.set_add("user:u1:active_tasks", "t2").await.unwrap());
        store.set_add("user:u1:active_tasks", "t1").await.unwrap();
        assert_eq!(store.set_members("user:u1:active_tasks").await.unwrap(), vec!["t1", "t2"]);
        assert!(store.set_remove("user:u1:active_tasks", "t1").await.unwrap());

        store.set("approval:a", "1".into(), None).await.unwrap();
        store.set("approvals:b", "2".into(), None).await.unwrap();
        let found = store.scan_prefix("approval:").await.unwrap();
        assert_eq!(found, vec![("approval:a".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_list_pop_wakes_on_push() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let popper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.list_pop("queue:jobs", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        store.list_push("queue:jobs", "t1".into()).await.unwrap();
        assert_eq!(popper.await.unwrap().unwrap().as_deref(), Some("t1"));
        assert_eq!(store.list_pop("queue:jobs", Duration::from_millis(20)).await.unwrap(), None);
    }
}
