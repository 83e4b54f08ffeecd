//! 记忆层：对话消息、上下文窗口裁剪、状态持久化、历史计划检索

pub mod context_window;
pub mod conversation;
pub mod persistence;
pub mod plan_memory;

pub use context_window::{ContextWindow, TokenEstimator};
pub use conversation::{Message, Role};
pub use persistence::StateStore;
pub use plan_memory::{InMemoryPlanMemory, PlanMemory};
