//! 参与者宿主：每个代理一个后台任务，串行处理总线请求

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{AgentError, BusRequest, WorkerAgent};

/// 启动代理的宿主任务，返回其收件通道（需在 tokio 运行时内调用）
pub fn spawn_participant(agent: Arc<dyn WorkerAgent>) -> mpsc::UnboundedSender<BusRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BusRequest>();

    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                BusRequest::Turn {
                    instruction,
                    cancel,
                    reply,
                } => match agent.handle(instruction, cancel.clone()).await {
                    Ok(mut stream) => loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                let _ = reply.send(Err(AgentError::Cancelled));
                                break;
                            }
                            item = stream.next() => match item {
                                Some(event) => {
                                    if reply.send(Ok(event)).is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    },
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                BusRequest::SaveState { reply } => {
                    let _ = reply.send(agent.save_state().await);
                }
                BusRequest::LoadState { state, reply } => {
                    let _ = reply.send(agent.load_state(state).await);
                }
            }
        }
        tracing::debug!(agent = agent.name(), "Participant stopped");
    });

    tx
}
