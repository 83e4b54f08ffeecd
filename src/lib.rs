//! Orca - 多代理任务编排
//!
//! 模块划分：
//! - **agents**: 内置参与者（LLM 工作代理、终端用户代理）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: LLM 消息、上下文窗口、状态持久化、历史计划记忆
//! - **observability**: tracing 初始化
//! - **orchestrator**: 规划 ↔ 执行状态机、进度账本、哨兵步骤、最终答案
//! - **plan**: 计划与步骤模型
//! - **team**: 代理抽象、消息总线、团队装配

pub mod agents;
pub mod config;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod team;

pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorHandle, OrchestratorState};
pub use team::{Team, TeamBuilder, TeamResult};
