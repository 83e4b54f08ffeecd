//! 基于 LLM 的通用工作代理：保留自己的对话，每条指令回复一次

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::team::{AgentError, AgentEvent, AgentStream, ChatMessage, WorkerAgent};

pub struct LlmWorker {
    name: String,
    description: String,
    system_prompt: String,
    llm: Arc<dyn LlmClient>,
    history: Mutex<Vec<Message>>,
}

impl LlmWorker {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        Self {
            system_prompt: format!(
                "You are {}, {}. Do what you are asked and report the result.",
                name, description
            ),
            name,
            description,
            llm,
            history: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Message>>, AgentError> {
        self.history
            .lock()
            .map_err(|_| AgentError::Failed(format!("{} history lock poisoned", self.name)))
    }
}

#[async_trait]
impl WorkerAgent for LlmWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn handle(
        &self,
        instruction: ChatMessage,
        cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        let mut context = vec![Message::system(self.system_prompt.clone())];
        {
            let mut history = self.lock()?;
            history.push(Message::user(instruction.content));
            context.extend(history.iter().cloned());
        }

        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            res = self.llm.complete(&context) => res.map_err(|e| AgentError::Failed(e.to_string()))?,
        };
        tracing::debug!(agent = %self.name, chars = completion.content.len(), "Worker replied");

        self.lock()?.push(Message::assistant(completion.content.clone()));
        let reply = ChatMessage::new(&self.name, completion.content);
        Ok(Box::pin(stream::iter([AgentEvent::Final(reply)])))
    }

    async fn save_state(&self) -> Result<Value, AgentError> {
        let history = self.lock()?;
        serde_json::to_value(&*history).map_err(|e| AgentError::Failed(e.to_string()))
    }

    async fn load_state(&self, state: Value) -> Result<(), AgentError> {
        let restored: Vec<Message> =
            serde_json::from_value(state).map_err(|e| AgentError::Failed(e.to_string()))?;
        *self.lock()? = restored;
        Ok(())
    }
}
