//! 编排器状态：只由编排器自己的事件循环修改；可序列化以便重启后继续（`paused` 不持久化）

use serde::{Deserialize, Serialize};

use crate::plan::Plan;
use crate::team::ChatMessage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Planning,
    Execution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorState {
    pub task: String,
    pub plan: Option<Plan>,
    pub current_step_index: usize,
    pub round_count: u32,
    pub replan_count: u32,
    pub information_collected: String,
    pub mode: Mode,
    #[serde(skip)]
    pub paused: bool,
    pub message_history: Vec<ChatMessage>,
}

impl OrchestratorState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// 追问前的部分重置：保留对话历史与已收集的信息
    pub fn reset_for_followup(&mut self) {
        let history = std::mem::take(&mut self.message_history);
        let info = std::mem::take(&mut self.information_collected);
        self.reset();
        self.message_history = history;
        self.information_collected = info;
    }

    /// 追加一段进度摘要
    pub fn collect(&mut self, summary: &str) {
        if summary.is_empty() {
            return;
        }
        if !self.information_collected.is_empty() {
            self.information_collected.push('\n');
        }
        self.information_collected.push_str(summary);
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
