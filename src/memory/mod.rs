//! 记忆层：会话记录（存储层持有）与有界上下文构建（摘要 + 滑动窗口 + 字符预算）

pub mod conversation;
pub mod manager;

pub use conversation::{
    ConversationRecord, ConversationStore, InMemoryConversationStore, Message, Role,
    SharedConversationStore,
};
pub use manager::{ConversationSummary, MemoryManager, MemoryState, MessageRange};
