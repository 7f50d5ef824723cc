//! 云盘存储操作目录
//!
//! 存储层（文件/文件夹/文档 CRUD、搜索、索引）是外部服务，这里只把它固定的操作目录包装成 Tool：
//! 每个 StorageTool 校验必填参数后转发给 StorageBackend。HttpStorageBackend 以 POST {base}/ops/{op} 调用。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::tools::{Tool, ToolRegistry};

/// 存储服务接口：按操作名调用，返回文本结果或错误标记
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn call(&self, op: &str, args: &Value) -> Result<String, String>;
}

/// 目录中的一个操作
#[derive(Debug)]
pub struct StorageOp {
    pub name: &'static str,
    pub description: &'static str,
    pub required: &'static [&'static str],
    pub mutating: bool,
}

const fn op(
    name: &'static str,
    description: &'static str,
    required: &'static [&'static str],
    mutating: bool,
) -> StorageOp {
    StorageOp {
        name,
        description,
        required,
        mutating,
    }
}

pub const CATALOGUE: &[StorageOp] = &[
    // 文件与文件夹
    op("list_files", "List files, optionally inside folderId", &[], false),
    op("list_folders", "List folders, optionally inside parentId", &[], false),
    op("get_file_info", "Get metadata of a file", &["fileId"], false),
    op("create_folder", "Create a folder named name under parentId (root if absent)", &["name"], true),
    op("rename_file", "Rename a file", &["fileId", "newName"], true),
    op("rename_folder", "Rename a folder", &["folderId", "newName"], true),
    op("move_file", "Move a file into targetFolderId", &["fileId", "targetFolderId"], true),
    op("move_folder", "Move a folder into targetFolderId", &["folderId", "targetFolderId"], true),
    op("trash_file", "Move a file to the trash", &["fileId"], true),
    op("trash_folder", "Move a folder to the trash", &["folderId"], true),
    op("restore_file", "Restore a file from the trash", &["fileId"], true),
    op("restore_folder", "Restore a folder from the trash", &["folderId"], true),
    op("delete_file", "Permanently delete a file", &["fileId"], true),
    op("delete_folder", "Permanently delete a folder and everything inside it", &["folderId"], true),
    op("empty_trash", "Permanently delete everything in the trash", &[], true),
    op("star_file", "Star a file", &["fileId"], true),
    op("unstar_file", "Remove the star from a file", &["fileId"], true),
    op("star_folder", "Star a folder", &["folderId"], true),
    op("unstar_folder", "Remove the star from a folder", &["folderId"], true),
    // 文档内容
    op("read_document", "Read the text content of a document", &["fileId"], false),
    op("patch_document", "Apply a find/replace patch to a document", &["fileId", "find", "replace"], true),
    op("write_document", "Overwrite the content of a document", &["fileId", "content"], true),
    // 搜索与索引
    op("search_files", "Keyword search over file names and content", &["query"], false),
    op("semantic_search", "Semantic search over indexed documents", &["query"], false),
    op("index_file", "(Re)index a file for semantic search", &["fileId"], true),
];

pub fn find_op(name: &str) -> Option<&'static StorageOp> {
    CATALOGUE.iter().find(|op| op.name == name)
}

/// 把一个目录操作包装为 Tool
pub struct StorageTool {
    op: &'static StorageOp,
    backend: Arc<dyn StorageBackend>,
}

impl StorageTool {
    pub fn new(op: &'static StorageOp, backend: Arc<dyn StorageBackend>) -> Self {
        Self { op, backend }
    }
}

#[async_trait]
impl Tool for StorageTool {
    fn name(&self) -> &str {
        self.op.name
    }

    fn description(&self) -> &str {
        self.op.description
    }

    fn parameters_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .op
            .required
            .iter()
            .map(|k| (k.to_string(), serde_json::json!({"type": "string"})))
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.op.required,
        })
    }

    fn is_mutating(&self) -> bool {
        self.op.mutating
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let missing: Vec<&str> = self
            .op
            .required
            .iter()
            .copied()
            .filter(|k| args.get(*k).map(|v| v.is_null()).unwrap_or(true))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing argument(s): {}", missing.join(", ")));
        }
        self.backend.call(self.op.name, &args).await
    }
}

/// 注册整个存储目录
pub fn register_catalogue(registry: &mut ToolRegistry, backend: Arc<dyn StorageBackend>) {
    for op in CATALOGUE {
        registry.register(StorageTool::new(op, Arc::clone(&backend)));
    }
}

/// 通过 HTTP 调用存储服务
pub struct HttpStorageBackend {
    client: Client,
    base_url: String,
}

impl HttpStorageBackend {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for HttpStorageBackend {
    async fn call(&self, op: &str, args: &Value) -> Result<String, String> {
        let url = format!("{}/ops/{}", self.base_url, op);
        let resp = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| format!("Failed to read response: {}", e))?;
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, body));
        }
        Ok(body)
    }
}
