//! 内置参与者：LLM 工作代理与终端用户代理

mod console_user;
mod llm_worker;

pub use console_user::ConsoleUser;
pub use llm_worker::LlmWorker;
