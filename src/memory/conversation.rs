//! 消息与会话记录
//!
//! 会话记录由存储层持有（有序消息日志 + 摘要 + 可选计划快照），引擎只通过 ConversationStore 读写。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::memory::ConversationSummary;
use crate::planning::TaskPlan;
use crate::store::{get_json, set_json, SharedStore, StoreError};

/// 消息角色（Tool 为工具执行结果）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// 存储层的会话记录
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summaries: Vec<ConversationSummary>,
    #[serde(default)]
    pub plan: Option<TaskPlan>,
}

/// 会话记录读写接口（由存储层实现）
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 读取会话；不存在时返回空记录
    async fn load(&self, conversation_id: &str) -> Result<ConversationRecord, StoreError>;

    async fn save(&self, conversation_id: &str, record: &ConversationRecord) -> Result<(), StoreError>;
}

/// 内存版会话存储（测试与本地运行）
#[derive(Default)]
pub struct InMemoryConversationStore {
    records: RwLock<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<ConversationRecord, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, conversation_id: &str, record: &ConversationRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(conversation_id.to_string(), record.clone());
        Ok(())
    }
}

/// 基于 SharedStore 的会话存储，键为 conversation:{id}；底层是 SqliteStore 时随之落盘
pub struct SharedConversationStore {
    store: Arc<dyn SharedStore>,
}

impl SharedConversationStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }
}

fn conversation_key(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

#[async_trait]
impl ConversationStore for SharedConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<ConversationRecord, StoreError> {
        Ok(get_json(self.store.as_ref(), &conversation_key(conversation_id))
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, conversation_id: &str, record: &ConversationRecord) -> Result<(), StoreError> {
        set_json(self.store.as_ref(), &conversation_key(conversation_id), record, None).await
    }
}
