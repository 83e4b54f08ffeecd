//! 团队：参与者、消息总线与编排器的装配
//!
//! TeamBuilder 校验配置后为每个代理启动宿主任务、注册到总线，再启动编排器。
//! Team::run 提交任务并收集广播消息，直到收到终止信号。

pub mod agent;
pub mod bus;
pub mod host;
pub mod message;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::llm::LlmClient;
use crate::memory::PlanMemory;
use crate::orchestrator::{
    prompts, Orchestrator, OrchestratorError, OrchestratorHandle, Roster, RunSignals,
    NO_ACTION_AGENT, ORCHESTRATOR_NAME,
};
use crate::plan::Plan;

pub use agent::{AgentError, AgentStream, WorkerAgent};
pub use bus::{AgentTurn, BusError, BusRequest, MessageBus};
pub use host::spawn_participant;
pub use message::{
    AgentEvent, ChatMessage, MessageKind, StopSignal, TeamEvent, META_CHECK_NUMBER,
    META_INTERNAL, META_SENTINEL_ID, META_TYPE,
};

pub struct TeamBuilder {
    llm: Arc<dyn LlmClient>,
    config: OrchestratorConfig,
    agents: Vec<Arc<dyn WorkerAgent>>,
    user_agent: Option<Arc<dyn WorkerAgent>>,
    plan: Option<Plan>,
    memory: Option<Arc<dyn PlanMemory>>,
}

impl TeamBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, config: OrchestratorConfig) -> Self {
        Self {
            llm,
            config,
            agents: Vec::new(),
            user_agent: None,
            plan: None,
            memory: None,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn WorkerAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// 代表人类的参与者：确认计划、回答追问
    pub fn with_user_agent(mut self, agent: Arc<dyn WorkerAgent>) -> Self {
        self.user_agent = Some(agent);
        self
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn PlanMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 需在 tokio 运行时内调用
    pub fn build(self) -> Result<Team, OrchestratorError> {
        if self.config.requires_user_agent() && self.user_agent.is_none() {
            return Err(OrchestratorError::Config(
                "a user agent is required unless execution is autonomous without cooperative planning or follow-up input"
                    .to_string(),
            ));
        }

        let bus = MessageBus::new();
        let participants: Vec<_> = self
            .user_agent
            .iter()
            .chain(self.agents.iter())
            .cloned()
            .collect();
        for agent in &participants {
            let name = agent.name();
            if name == NO_ACTION_AGENT || name == ORCHESTRATOR_NAME {
                return Err(OrchestratorError::Config(format!(
                    "`{}` is a reserved participant name",
                    name
                )));
            }
            bus.register(name, spawn_participant(agent.clone()))?;
        }

        let user_name = self.user_agent.as_ref().map(|a| a.name().to_string());
        let exclude = if self.config.autonomous_execution {
            user_name.as_deref()
        } else {
            None
        };
        let roster = Roster::build(
            participants
                .iter()
                .map(|a| (a.name().to_string(), a.description().to_string())),
            exclude,
        );
        tracing::info!(team = ?roster.names(), "Team assembled");

        let mut orchestrator = Orchestrator::new(
            self.config,
            self.llm,
            bus.clone(),
            roster,
            RunSignals::new(),
        );
        if let Some(name) = user_name {
            orchestrator = orchestrator.with_user_agent(name);
        }
        if let Some(memory) = self.memory {
            orchestrator = orchestrator.with_memory(memory);
        }
        if let Some(plan) = self.plan {
            orchestrator = orchestrator.with_plan(plan);
        }

        Ok(Team {
            handle: orchestrator.spawn(),
            bus,
        })
    }
}

pub struct Team {
    bus: MessageBus,
    handle: OrchestratorHandle,
}

impl Team {
    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TeamEvent> {
        self.bus.subscribe()
    }

    /// 提交任务并等待终止信号
    pub async fn run(&self, task: impl Into<String>) -> Result<TeamResult, OrchestratorError> {
        let mut events = self.subscribe();
        self.handle.start(task)?;
        let mut messages = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                TeamEvent::Message(m) => messages.push(m),
                TeamEvent::Terminated(stop) => return Ok(TeamResult { messages, stop }),
            }
        }
        Err(OrchestratorError::Closed)
    }
}

/// 一次运行期间广播的全部消息及终止原因
#[derive(Debug, Clone)]
pub struct TeamResult {
    pub messages: Vec<ChatMessage>,
    pub stop: StopSignal,
}

impl TeamResult {
    /// 最后一条最终答案（去掉固定前缀）
    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.kind() == Some(MessageKind::FinalAnswer))
            .find_map(|m| prompts::extract_final_answer(&m.content))
    }
}
