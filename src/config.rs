//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORCA__*` 覆盖（双下划线表示嵌套，如 `ORCA__ORCHESTRATOR__MAX_TURNS=30`）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// [app] 段：应用名、状态文件路径
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 编排器状态快照（暂停/退出时写入，--resume 时读取）
    pub state_path: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

/// 规划阶段如何使用记忆中的历史计划
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanRetrieval {
    /// 不检索
    #[default]
    Never,
    /// 把最相关的历史计划作为提示放进规划上下文
    Hint,
    /// 直接复用最相关的历史计划，跳过规划调用
    Reuse,
}

/// [orchestrator] 段：规划、执行轮次、重规划与哨兵步骤
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// 执行前需要用户确认/编辑计划
    #[serde(default = "default_true")]
    pub cooperative_planning: bool,
    /// 执行过程中不再询问用户（用户代理从名册中移除）
    #[serde(default)]
    pub autonomous_execution: bool,
    /// 给出最终答案后允许用户追问
    #[serde(default = "default_true")]
    pub allow_follow_up_input: bool,
    /// 执行轮次上限
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// 结构化响应的最大尝试次数
    #[serde(default = "default_max_json_retries")]
    pub max_json_retries: u32,
    #[serde(default = "default_true")]
    pub allow_for_replans: bool,
    /// 重规划次数上限；None 表示不限
    #[serde(default = "default_max_replans")]
    pub max_replans: Option<u32>,
    /// 发给模型的上下文 token 上限
    #[serde(default = "default_context_token_limit")]
    pub model_context_token_limit: usize,
    #[serde(default)]
    pub retrieve_relevant_plans: PlanRetrieval,
    /// 用户反馈触发重新规划时保留原任务描述
    #[serde(default)]
    pub no_overwrite_of_task: bool,
    /// 自定义最终答案提示，支持 `{task}` 占位符
    #[serde(default)]
    pub final_answer_prompt: Option<String>,
    /// 允许访问的网站（写进规划与账本提示）
    #[serde(default)]
    pub allowed_websites: Vec<String>,
    #[serde(default)]
    pub sentinel: SentinelSection,
}

fn default_true() -> bool {
    true
}

fn default_max_turns() -> u32 {
    20
}

fn default_max_json_retries() -> u32 {
    3
}

fn default_max_replans() -> Option<u32> {
    Some(3)
}

fn default_context_token_limit() -> usize {
    110_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cooperative_planning: true,
            autonomous_execution: false,
            allow_follow_up_input: true,
            max_turns: default_max_turns(),
            max_json_retries: default_max_json_retries(),
            allow_for_replans: true,
            max_replans: default_max_replans(),
            model_context_token_limit: default_context_token_limit(),
            retrieve_relevant_plans: PlanRetrieval::Never,
            no_overwrite_of_task: false,
            final_answer_prompt: None,
            allowed_websites: Vec::new(),
            sentinel: SentinelSection::default(),
        }
    }
}

impl OrchestratorConfig {
    /// 是否需要注册用户代理
    pub fn requires_user_agent(&self) -> bool {
        !self.autonomous_execution || self.allow_follow_up_input || self.cooperative_planning
    }
}

/// [orchestrator.sentinel] 段：哨兵步骤
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelSection {
    #[serde(default = "default_true")]
    pub enable_sentinel_steps: bool,
    /// 允许模型在每次检查后建议下一次的睡眠时长
    #[serde(default)]
    pub dynamic_sentinel_sleep: bool,
    /// 连续检查出错多少次后放弃该步骤
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// 检查出错后的睡眠上限（秒）
    #[serde(default = "default_error_sleep_cap_secs")]
    pub error_sleep_cap_secs: u64,
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_error_sleep_cap_secs() -> u64 {
    30
}

impl Default for SentinelSection {
    fn default() -> Self {
        Self {
            enable_sentinel_steps: true,
            dynamic_sentinel_sleep: false,
            max_consecutive_errors: default_max_consecutive_errors(),
            error_sleep_cap_secs: default_error_sleep_cap_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ORCA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORCA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
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
        config::Environment::with_prefix("ORCA")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_defaults() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.cooperative_planning);
        assert_eq!(cfg.max_json_retries, 3);
        assert_eq!(cfg.model_context_token_limit, 110_000);
        assert_eq!(cfg.sentinel.max_consecutive_errors, 3);
        assert_eq!(cfg.sentinel.error_sleep_cap_secs, 30);
        assert!(cfg.requires_user_agent());
    }

    #[test]
    fn test_autonomous_without_user_agent() {
        let cfg = OrchestratorConfig {
            cooperative_planning: false,
            autonomous_execution: true,
            allow_follow_up_input: false,
            ..OrchestratorConfig::default()
        };
        assert!(!cfg.requires_user_agent());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orca.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
max_turns = 7
retrieve_relevant_plans = "reuse"

[orchestrator.sentinel]
dynamic_sentinel_sleep = true
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_turns, 7);
        assert_eq!(cfg.orchestrator.retrieve_relevant_plans, PlanRetrieval::Reuse);
        assert!(cfg.orchestrator.sentinel.dynamic_sentinel_sleep);
        assert!(cfg.orchestrator.sentinel.enable_sentinel_steps);
    }
}
