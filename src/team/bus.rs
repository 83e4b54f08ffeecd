//! 消息总线：按代理名寻址的请求通道 + 广播订阅
//!
//! 每个参与者注册一个收件通道（名字 -> 通道一一对应，重复注册被拒绝）；
//! 编排器通过总线请求某个参与者发言、保存/恢复其状态，并向所有订阅者广播消息。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{AgentError, AgentEvent, ChatMessage, TeamEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("No participant registered as `{0}`")]
    UnknownTopic(String),

    #[error("Participant `{0}` is already registered")]
    DuplicateTopic(String),

    #[error("Participant `{0}` is no longer running")]
    Closed(String),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// 发往参与者收件通道的请求
pub enum BusRequest {
    Turn {
        instruction: ChatMessage,
        cancel: CancellationToken,
        reply: mpsc::UnboundedSender<Result<AgentEvent, AgentError>>,
    },
    SaveState {
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    LoadState {
        state: Value,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
}

/// 进行中的一个代理回合：逐个读取事件，通道关闭即回合结束
pub struct AgentTurn {
    events: mpsc::UnboundedReceiver<Result<AgentEvent, AgentError>>,
}

impl AgentTurn {
    pub async fn next(&mut self) -> Option<Result<AgentEvent, AgentError>> {
        self.events.recv().await
    }
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, mpsc::UnboundedSender<BusRequest>>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<TeamEvent>>>,
}

#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        inbox: mpsc::UnboundedSender<BusRequest>,
    ) -> Result<(), BusError> {
        let mut topics = self
            .inner
            .topics
            .write()
            .map_err(|_| BusError::Closed(name.to_string()))?;
        if topics.contains_key(name) {
            return Err(BusError::DuplicateTopic(name.to_string()));
        }
        topics.insert(name.to_string(), inbox);
        tracing::debug!(participant = name, "Participant registered");
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner
            .topics
            .read()
            .map(|t| t.contains_key(name))
            .unwrap_or(false)
    }

    fn inbox(&self, name: &str) -> Result<mpsc::UnboundedSender<BusRequest>, BusError> {
        self.inner
            .topics
            .read()
            .map_err(|_| BusError::Closed(name.to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownTopic(name.to_string()))
    }

    /// 请求参与者发言一次
    pub fn request_turn(
        &self,
        name: &str,
        instruction: ChatMessage,
        cancel: CancellationToken,
    ) -> Result<AgentTurn, BusError> {
        let (reply, events) = mpsc::unbounded_channel();
        self.inbox(name)?
            .send(BusRequest::Turn {
                instruction,
                cancel,
                reply,
            })
            .map_err(|_| BusError::Closed(name.to_string()))?;
        Ok(AgentTurn { events })
    }

    pub async fn save_agent_state(&self, name: &str) -> Result<Value, BusError> {
        let (reply, rx) = oneshot::channel();
        self.inbox(name)?
            .send(BusRequest::SaveState { reply })
            .map_err(|_| BusError::Closed(name.to_string()))?;
        let state = rx.await.map_err(|_| BusError::Closed(name.to_string()))??;
        Ok(state)
    }

    pub async fn load_agent_state(&self, name: &str, state: Value) -> Result<(), BusError> {
        let (reply, rx) = oneshot::channel();
        self.inbox(name)?
            .send(BusRequest::LoadState { state, reply })
            .map_err(|_| BusError::Closed(name.to_string()))?;
        rx.await.map_err(|_| BusError::Closed(name.to_string()))??;
        Ok(())
    }

    /// 广播给所有订阅者；已关闭的订阅者被移除
    pub fn publish(&self, event: TeamEvent) {
        if let Ok(mut subs) = self.inner.subscribers.write() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn publish_message(&self, message: ChatMessage) {
        self.publish(TeamEvent::Message(message));
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TeamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.inner.subscribers.write() {
            subs.push(tx);
        }
        rx
    }
}
