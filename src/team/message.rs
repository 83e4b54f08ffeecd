//! 团队消息：聊天消息、代理事件流、终止信号

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::memory::Message;

pub const META_INTERNAL: &str = "internal";
pub const META_TYPE: &str = "type";
pub const META_SENTINEL_ID: &str = "sentinel_id";
pub const META_CHECK_NUMBER: &str = "check_number";

/// 编排器发布的消息类型（写入 metadata["type"]）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    PlanMessage,
    TaskLedger,
    StepExecution,
    ProgressLedger,
    Replanning,
    FinalAnswer,
    UserRequest,
    SentinelStart,
    SentinelCheck,
    SentinelComplete,
    SentinelPaused,
    SentinelError,
    OrchestratorError,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PlanMessage => "plan_message",
            MessageKind::TaskLedger => "task_ledger",
            MessageKind::StepExecution => "step_execution",
            MessageKind::ProgressLedger => "progress_ledger",
            MessageKind::Replanning => "replanning",
            MessageKind::FinalAnswer => "final_answer",
            MessageKind::UserRequest => "user_request",
            MessageKind::SentinelStart => "sentinel_start",
            MessageKind::SentinelCheck => "sentinel_check",
            MessageKind::SentinelComplete => "sentinel_complete",
            MessageKind::SentinelPaused => "sentinel_paused",
            MessageKind::SentinelError => "sentinel_error",
            MessageKind::OrchestratorError => "orchestrator_error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// 团队内流转的一条消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub source: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ChatMessage {
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_kind(self, kind: MessageKind) -> Self {
        self.with_meta(META_TYPE, kind.as_str())
    }

    pub fn internal(self, internal: bool) -> Self {
        self.with_meta(META_INTERNAL, if internal { "yes" } else { "no" })
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.metadata.get(META_TYPE).and_then(|t| MessageKind::parse(t))
    }

    pub fn is_internal(&self) -> bool {
        self.metadata.get(META_INTERNAL).map(String::as_str) == Some("yes")
    }

    /// 转为 LLM 消息：`own_name` 发出的为 assistant，其余为带来源前缀的 user
    pub fn to_llm(&self, own_name: &str) -> Message {
        if self.source == own_name {
            Message::assistant(self.content.clone())
        } else {
            Message::user(format!("{}: {}", self.source, self.content))
        }
    }
}

/// 代理响应流中的一项；一个回合以恰好一个 Final 结束
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Inner(ChatMessage),
    Final(ChatMessage),
}

impl AgentEvent {
    pub fn message(&self) -> &ChatMessage {
        match self {
            AgentEvent::Inner(m) | AgentEvent::Final(m) => m,
        }
    }

    pub fn into_message(self) -> ChatMessage {
        match self {
            AgentEvent::Inner(m) | AgentEvent::Final(m) => m,
        }
    }
}

/// 运行结束信号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSignal {
    pub reason: String,
    pub error: bool,
}

impl StopSignal {
    pub fn completed(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error: false,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error: true,
        }
    }
}

/// 订阅者收到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeamEvent {
    Message(ChatMessage),
    Terminated(StopSignal),
}
