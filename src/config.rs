//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRIVEBEE__*` 覆盖（双下划线表示嵌套，如 `DRIVEBEE__GATEWAY__RATE_LIMIT_MAX=100`）。
//! 所有旋钮都是启动时读取的数值，运行期不做动态重载。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub gateway: GatewaySection,
    pub memory: MemorySection,
    pub planner: PlannerSection,
    pub queue: QueueSection,
    pub storage: StorageSection,
    pub store: StoreSection,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [orchestrator] 段：步骤重试与单轮工具调用上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 工具结果全部出错时的重试次数（首次尝试之外）
    pub max_tool_retries: u32,
    /// 单个 Agent 单轮内最多调用的工具数
    pub max_tool_calls_per_turn: usize,
    /// 计划步骤未指定 agentType 时使用的 Agent
    pub default_agent: String,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_tool_retries: 2,
            max_tool_calls_per_turn: 8,
            default_agent: "general".to_string(),
            tool_timeout_secs: 30,
        }
    }
}

/// [gateway] 段：限流窗口、审批 TTL、清扫周期、资源锁
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: u64,
    pub approval_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// 审批终态记录的保留时间（迟到的 resolve 仍能看到终态）
    pub approval_retention_secs: u64,
    pub lock_ttl_secs: u64,
    pub lock_wait_ms: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            rate_limit_window_secs: 60,
            rate_limit_max: 50,
            approval_ttl_secs: 300,
            sweep_interval_secs: 60,
            approval_retention_secs: 3600,
            lock_ttl_secs: 30,
            lock_wait_ms: 5000,
        }
    }
}

/// [memory] 段：摘要阈值、滑动窗口、字符预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 消息数超过此值才开始摘要
    pub summary_threshold: usize,
    pub sliding_window_size: usize,
    /// 单次模型调用的字符预算
    pub max_context_chars: usize,
    /// 压缩时永不触碰的最新消息数
    pub keep_recent: usize,
    /// 超过此长度的工具结果在压缩时被替换为标记
    pub tool_result_max_chars: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            summary_threshold: 30,
            sliding_window_size: 20,
            max_context_chars: 60_000,
            keep_recent: 6,
            tool_result_max_chars: 2_000,
        }
    }
}

/// [planner] 段：快速过滤与计划规模
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 短于此字符数的消息直接判定为无需规划
    pub min_message_chars: usize,
    /// 命中多少条多步线索即判定需要规划
    pub cue_threshold: usize,
    /// 计划步骤硬上限
    pub max_steps: usize,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            min_message_chars: 12,
            cue_threshold: 2,
            max_steps: 6,
        }
    }
}

/// [queue] 段：Worker 并发与结果保留
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub worker_concurrency: usize,
    /// 已完成/失败任务的状态保留时间（供迟到的状态查询）
    pub result_retention_secs: u64,
    /// Worker 阻塞拉取的单次等待时间
    pub poll_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            result_retention_secs: 3600,
            poll_timeout_ms: 1000,
        }
    }
}

/// [storage] 段：云盘存储服务地址（文件/文件夹/文档操作的外部提供方）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/assistant".to_string(),
            timeout_secs: 30,
        }
    }
}

/// [store] 段：共享存储后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// sqlite（落盘，重启不丢作业与审批）/ memory（仅单进程测试）
    pub backend: String,
    /// SQLite 数据库文件路径
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: "data/drivebee.db".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DRIVEBEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRIVEBEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DRIVEBEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
