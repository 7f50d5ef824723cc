//! drivebee - 云盘智能助手的任务编排与审批引擎
//!
//! 模块划分：
//! - **agent**: 运行时装配与聊天处理流程（ChatProcessor）
//! - **agents**: Agent trait、按类型查表的注册表、工具循环 ToolAgent、单步路由
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、优雅关闭
//! - **gateway**: 能力网关（ACL、风险分级、限流、人工审批）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话记录、摘要 + 滑动窗口、上下文压缩
//! - **observability**: 日志初始化
//! - **orchestrator**: 按依赖分波次并发执行计划
//! - **planning**: 是否规划、计划生成与进度跟踪
//! - **queue**: 异步任务队列、事件总线、Worker 池
//! - **store**: 共享 KV / 发布订阅存储与资源锁
//! - **tools**: 工具注册表、执行器、云盘存储操作目录

pub mod agent;
pub mod agents;
pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod planning;
pub mod queue;
pub mod store;
pub mod tools;

pub use agent::{create_runtime, AssistantRuntime, ChatProcessor};
