//! 终端用户代理：每个回合从标准输入读一行

use async_trait::async_trait;
use futures_util::stream;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::team::{AgentError, AgentEvent, AgentStream, ChatMessage, WorkerAgent};

pub struct ConsoleUser {
    name: String,
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsoleUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl WorkerAgent for ConsoleUser {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "The human user. Ask them for clarification, approval or information only they have."
    }

    async fn handle(
        &self,
        _instruction: ChatMessage,
        cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        let mut lines = self.lines.lock().await;
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            line = lines.next_line() => line.map_err(|e| AgentError::Failed(e.to_string()))?,
        };
        let text = line.ok_or(AgentError::InputClosed)?;
        let reply = ChatMessage::new(&self.name, text.trim());
        Ok(Box::pin(stream::iter([AgentEvent::Final(reply)])))
    }
}
