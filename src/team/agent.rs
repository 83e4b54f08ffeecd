//! 工作代理抽象
//!
//! 每个代理在一个回合内收到一条指令，返回事件流（若干 Inner + 一个 Final）；
//! 可选支持状态快照（哨兵步骤在迭代之间恢复代理状态）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{AgentEvent, ChatMessage};

pub type AgentStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent failed: {0}")]
    Failed(String),

    #[error("Agent `{0}` does not support state snapshots")]
    StateUnsupported(String),

    #[error("Agent input closed")]
    InputClosed,

    #[error("Agent turn cancelled")]
    Cancelled,
}

#[async_trait]
pub trait WorkerAgent: Send + Sync {
    fn name(&self) -> &str;

    /// 写进团队描述，供规划与账本选择代理
    fn description(&self) -> &str;

    /// 处理一条指令；取消令牌触发时应尽快结束流
    async fn handle(
        &self,
        instruction: ChatMessage,
        cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError>;

    async fn save_state(&self) -> Result<Value, AgentError> {
        Err(AgentError::StateUnsupported(self.name().to_string()))
    }

    async fn load_state(&self, _state: Value) -> Result<(), AgentError> {
        Err(AgentError::StateUnsupported(self.name().to_string()))
    }
}
