//! 编排器错误类型
//!
//! `Interrupted` 表示暂停或取消，永远不会作为失败上报；其余错误终止当前运行并发出错误停止信号。

use thiserror::Error;

use crate::llm::LlmError;
use crate::plan::PlanError;
use crate::team::{AgentError, BusError};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid plan: {0}")]
    Schema(#[from] PlanError),

    #[error("No valid structured response after {attempts} attempts: {last_error}")]
    LedgerProtocolExhausted {
        attempts: u32,
        last_error: String,
        last_response: String,
    },

    #[error("Invalid agent `{name}`, participants are: {roster}")]
    InvalidAgent { name: String, roster: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Interrupted")]
    Interrupted,

    #[error("No plan to execute")]
    MissingPlan,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Orchestrator is not running")]
    Closed,
}

impl OrchestratorError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, OrchestratorError::Interrupted)
    }
}
