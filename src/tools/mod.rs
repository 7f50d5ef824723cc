//! 工具层：Tool trait 与注册表、带超时与审计日志的执行器、云盘存储操作目录

pub mod executor;
pub mod registry;
pub mod storage;

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};
pub use storage::{
    find_op, register_catalogue, HttpStorageBackend, StorageBackend, StorageOp, StorageTool,
    CATALOGUE,
};

use serde::{Deserialize, Serialize};

/// 一次工具调用的结果；失败也作为数据回流给 Agent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            content: content.into(),
            is_error: true,
        }
    }
}
