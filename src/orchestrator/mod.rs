//! 编排器：规划 ↔ 执行状态机
//!
//! 以 actor 方式运行：后台任务逐条处理邮箱命令（Start / Pause / Resume / Cancel / SaveState / LoadState），
//! 状态只由该任务修改。每次命令驱动状态机前进，直到需要等待外部输入（Idle）或运行结束（Stop）。
//!
//! 一轮执行：取进度账本 → 判断重规划/步骤完成 → 下发普通步骤（等待代理的一个回合）或交给哨兵执行器。
//! 暂停/取消通过 [`RunSignals`] 在每个挂起点生效；被打断的动作记录为恢复点，Resume 时重放。
//! 每个动作提交后状态快照写入 `watch` 通道，取快照不必等待进行中的动作。

mod error;
mod human_input;
mod ledger;
pub mod prompts;
mod roster;
mod sentinel;
mod state;
mod structured;
mod supervisor;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::{OrchestratorConfig, PlanRetrieval};
use crate::llm::LlmClient;
use crate::memory::{ContextWindow, Message, PlanMemory};
use crate::plan::{Plan, Step};
use crate::team::{
    AgentError, AgentEvent, ChatMessage, MessageBus, MessageKind, StopSignal, TeamEvent,
};

pub use error::OrchestratorError;
pub use human_input::{is_accepted_str, HumanInput};
pub use ledger::{Judgement, NextInstruction, PlanDecision, ProgressLedger, SentinelCheck};
pub use roster::{Roster, RosterEntry, NO_ACTION_AGENT, USER_AGENT};
pub use sentinel::{SentinelExecutor, SentinelOutcome, SentinelRunContext, SENTINEL_SOURCE};
pub use state::{Mode, OrchestratorState};
pub use structured::{extract_json_object, parse_json, StructuredResponder};
pub use supervisor::RunSignals;

pub const ORCHESTRATOR_NAME: &str = "orchestrator";

const APPROVAL_REQUEST: &str =
    "Please review the plan. Reply 'accept' to run it, or describe what should change.";
const FOLLOW_UP_REQUEST: &str = "Is there anything else you would like to ask?";
const PAUSED_REQUEST: &str = "The run is paused. Send a message, or resume when ready.";

/// 邮箱命令
enum Command {
    Start(String),
    Pause,
    Resume,
    Cancel,
    LoadState(Box<OrchestratorState>),
    Shutdown,
}

/// 状态机的下一个动作
#[derive(Debug, Clone)]
enum Next {
    /// 处理用户发来的一条消息
    HandleUser(ChatMessage),
    /// 请用户代理发言一次
    AskUser(String),
    /// 执行阶段的一轮
    Round { first_step: bool },
    /// 运行（或继续）当前的哨兵步骤
    Sentinel,
    Finalize(String),
    Idle,
    Stop(StopSignal),
}

pub struct Orchestrator {
    name: String,
    config: OrchestratorConfig,
    bus: MessageBus,
    responder: StructuredResponder,
    signals: RunSignals,
    roster: Roster,
    user_agent: Option<String>,
    memory: Option<Arc<dyn PlanMemory>>,
    preset_plan: Option<Plan>,
    state: OrchestratorState,
    sentinel_run: Option<SentinelRunContext>,
    resume: Option<Next>,
    snapshot: watch::Sender<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        llm: Arc<dyn LlmClient>,
        bus: MessageBus,
        roster: Roster,
        signals: RunSignals,
    ) -> Self {
        let window = ContextWindow::new(config.model_context_token_limit);
        let (snapshot, _) = watch::channel(OrchestratorState::default());
        Self {
            name: ORCHESTRATOR_NAME.to_string(),
            responder: StructuredResponder::new(llm, window, signals.clone()),
            config,
            bus,
            signals,
            roster,
            user_agent: None,
            memory: None,
            preset_plan: None,
            state: OrchestratorState::default(),
            sentinel_run: None,
            resume: None,
            snapshot,
        }
    }

    pub fn with_user_agent(mut self, name: impl Into<String>) -> Self {
        self.user_agent = Some(name.into());
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn PlanMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 预先给定的计划：首次规划时直接进入执行
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.preset_plan = Some(plan);
        self
    }

    /// 启动 actor 任务（需在 tokio 运行时内调用）
    pub fn spawn(self) -> OrchestratorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = OrchestratorHandle {
            tx,
            signals: self.signals.clone(),
            snapshot: self.snapshot.subscribe(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Start(task) => {
                    let msg = ChatMessage::new(self.user_source(), task);
                    self.record(msg.clone());
                    self.drive(Next::HandleUser(msg)).await;
                }
                Command::Pause => {
                    if !self.state.paused {
                        tracing::info!("Orchestrator paused while idle");
                        self.state.paused = true;
                        self.commit();
                    }
                }
                Command::Resume => {
                    self.signals.resume();
                    self.state.paused = false;
                    let next = self.resume.take().unwrap_or(Next::Idle);
                    tracing::info!(?next, "Orchestrator resumed");
                    self.drive(next).await;
                }
                Command::Cancel => {
                    // 运行中的取消已在 drive 里消费并换了新令牌
                    if self.signals.is_cancelled() {
                        self.signals.reset_cancel();
                        self.clear_run();
                        self.commit();
                        self.bus
                            .publish(TeamEvent::Terminated(StopSignal::completed("Cancelled")));
                    }
                }
                Command::LoadState(state) => {
                    self.load_state(*state);
                    self.commit();
                }
                Command::Shutdown => break,
            }
        }
        tracing::debug!("Orchestrator mailbox closed");
    }

    async fn drive(&mut self, mut next: Next) {
        loop {
            self.commit();
            if matches!(
                next,
                Next::Round { .. } | Next::Sentinel | Next::Finalize(_)
            ) && self.signals.is_interrupted()
            {
                next = self.on_interrupt(next);
                continue;
            }

            let current = next;
            let result = match &current {
                Next::Idle => return,
                Next::Stop(signal) => {
                    tracing::info!(reason = %signal.reason, error = signal.error, "Run terminated");
                    self.bus.publish(TeamEvent::Terminated(signal.clone()));
                    return;
                }
                Next::HandleUser(msg) => self.handle_user_message(msg.clone()).await,
                Next::AskUser(prompt) => self.ask_user(prompt).await,
                Next::Round { first_step } => self.execution_round(*first_step).await,
                Next::Sentinel => self.run_sentinel().await,
                Next::Finalize(reason) => self.prepare_final_answer(reason).await,
            };

            next = match result {
                Ok(n) => n,
                Err(e) if e.is_interrupt() => self.on_interrupt(current),
                Err(e) => self.on_fatal(e),
            };
        }
    }

    /// 发布已提交的状态快照
    fn commit(&self) {
        self.snapshot.send_replace(self.state.clone());
    }

    fn on_interrupt(&mut self, interrupted: Next) -> Next {
        if self.signals.is_cancelled() {
            tracing::info!("Run cancelled");
            self.signals.reset_cancel();
            self.clear_run();
            return Next::Stop(StopSignal::completed("Cancelled"));
        }
        if self.state.paused {
            if self.resume.is_none() {
                self.resume = Some(interrupted);
            }
            return Next::Idle;
        }

        tracing::info!(?interrupted, "Run paused");
        self.state.paused = true;
        self.resume = Some(interrupted);
        match self.user_agent {
            Some(_) => Next::AskUser(PAUSED_REQUEST.to_string()),
            None => Next::Idle,
        }
    }

    fn on_fatal(&mut self, err: OrchestratorError) -> Next {
        tracing::error!(error = %err, "Orchestrator run failed");
        self.bus.publish_message(
            ChatMessage::new(&self.name, format!("Error: {}", err))
                .with_kind(MessageKind::OrchestratorError)
                .internal(false),
        );
        self.clear_run();
        Next::Stop(StopSignal::failed(err.to_string()))
    }

    fn clear_run(&mut self) {
        self.signals.resume();
        self.state.reset();
        self.sentinel_run = None;
        self.resume = None;
    }

    fn load_state(&mut self, state: OrchestratorState) {
        self.state = state;
        self.state.paused = false;
        self.sentinel_run = None;
        self.resume = match (self.state.mode, self.state.plan.is_some()) {
            (Mode::Execution, true) => Some(Next::Round { first_step: false }),
            (Mode::Planning, true) => Some(Next::AskUser(APPROVAL_REQUEST.to_string())),
            _ => None,
        };
        tracing::info!(
            mode = ?self.state.mode,
            step = self.state.current_step_index,
            rounds = self.state.round_count,
            "Orchestrator state loaded"
        );
    }

    fn user_source(&self) -> String {
        self.user_agent.clone().unwrap_or_else(|| "user".to_string())
    }

    /// 写入历史并广播
    fn record(&mut self, msg: ChatMessage) {
        self.state.message_history.push(msg.clone());
        self.bus.publish_message(msg);
    }

    fn base_context(&self) -> Vec<Message> {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let mut context = vec![Message::system(prompts::system_message(&date))];
        context.extend(
            self.state
                .message_history
                .iter()
                .map(|m| m.to_llm(&self.name)),
        );
        context
    }

    fn check_roster(&self, name: &str) -> Result<(), OrchestratorError> {
        if self.roster.contains(name) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidAgent {
                name: name.to_string(),
                roster: self.roster.names().join(", "),
            })
        }
    }

    // ---- 规划 ----

    async fn handle_user_message(&mut self, msg: ChatMessage) -> Result<Next, OrchestratorError> {
        if self.state.paused {
            if self.resume.is_none() {
                self.resume = Some(Next::HandleUser(msg));
            }
            return Ok(Next::Idle);
        }
        match self.state.mode {
            Mode::Execution => Ok(Next::Round { first_step: false }),
            Mode::Planning => self.plan_from_user(&msg).await,
        }
    }

    async fn plan_from_user(&mut self, msg: &ChatMessage) -> Result<Next, OrchestratorError> {
        let input = HumanInput::parse(&msg.content);
        let first_time = self.state.task.is_empty() && self.state.plan.is_none();

        if first_time {
            self.state.task = input.content.clone();

            if let Some(plan) = self.preset_plan.take() {
                tracing::info!(steps = plan.len(), "Using preset plan");
                self.adopt_plan(plan, "Using the provided plan.");
                return Ok(self.enter_execution());
            }

            let remembered = self.remembered_plans().await;
            if self.config.retrieve_relevant_plans == PlanRetrieval::Reuse {
                if let Some(plan) = remembered.iter().find_map(|p| self.parse_remembered(p)) {
                    tracing::info!(steps = plan.len(), "Reusing remembered plan");
                    self.adopt_plan(plan, "Reusing a plan from a similar task.");
                    return Ok(self.after_plan());
                }
            }

            if let Some(value) = &input.plan {
                match Plan::from_json(value, &self.state.task) {
                    Ok(plan) if input.accepted => {
                        self.adopt_plan(plan, "Using the plan you provided.");
                        return Ok(self.enter_execution());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Ignoring user-supplied plan"),
                }
            }

            let hint = match self.config.retrieve_relevant_plans {
                PlanRetrieval::Hint => remembered.into_iter().next(),
                _ => None,
            };
            return self.create_plan(hint, false).await;
        }

        if input.accepted {
            if let Some(value) = &input.plan {
                match Plan::from_json(value, &self.state.task) {
                    Ok(plan) => self.state.plan = Some(plan),
                    Err(e) => {
                        return Ok(Next::AskUser(format!(
                            "The edited plan is invalid: {}. Fix it, or reply 'accept' to keep the current plan.",
                            e
                        )))
                    }
                }
            }
            if self.state.plan.is_some() {
                return Ok(self.enter_execution());
            }
        }

        // 已有完成的前缀时，用户反馈只替换未执行部分
        if self.state.current_step_index > 0 {
            if let Some(plan) = self.state.plan.clone() {
                return self.replan(&plan, &input.content).await;
            }
        }
        self.create_plan(None, true).await
    }

    async fn remembered_plans(&self) -> Vec<String> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        if self.config.retrieve_relevant_plans == PlanRetrieval::Never {
            return Vec::new();
        }
        match memory.retrieve_relevant(&self.state.task).await {
            Ok(plans) => plans,
            Err(e) => {
                tracing::warn!(error = %e, "Plan memory lookup failed");
                Vec::new()
            }
        }
    }

    fn parse_remembered(&self, raw: &str) -> Option<Plan> {
        let value = serde_json::Value::String(raw.to_string());
        match Plan::from_json(&value, &self.state.task) {
            Ok(mut plan) if !plan.is_empty() => {
                plan.task = self.state.task.clone();
                Some(plan)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable remembered plan");
                None
            }
        }
    }

    async fn create_plan(
        &mut self,
        hint: Option<String>,
        from_feedback: bool,
    ) -> Result<Next, OrchestratorError> {
        let mut context = self.base_context();
        if let Some(hint) = hint {
            context.push(Message::user(prompts::plan_hint(&hint)));
        }
        context.push(Message::user(prompts::planning_prompt(
            &self.roster.describe(),
            &PlanDecision::schema_json(),
            &self.config.allowed_websites,
            self.config.sentinel.enable_sentinel_steps,
        )));

        let task = self.state.task.clone();
        let decision = self
            .responder
            .get_structured_response(
                &context,
                |v| PlanDecision::validate(v, &task),
                self.config.max_json_retries,
            )
            .await?;

        if from_feedback && !self.config.no_overwrite_of_task {
            self.state.task = decision.task.clone();
        }

        if !decision.needs_plan {
            tracing::info!("Request answered directly without a plan");
            let answer = ChatMessage::new(&self.name, prompts::wrap_final_answer(&decision.response))
                .with_kind(MessageKind::FinalAnswer)
                .internal(false);
            self.record(answer);
            return Ok(self.finish_run("Final answer provided"));
        }

        tracing::info!(steps = decision.plan.len(), "Plan created");
        let mut plan = decision.plan;
        plan.task = self.state.task.clone();
        self.adopt_plan(plan, &decision.plan_summary);
        Ok(self.after_plan())
    }

    fn adopt_plan(&mut self, plan: Plan, summary: &str) {
        let msg = ChatMessage::new(&self.name, prompts::render_plan_message(summary, &plan))
            .with_kind(MessageKind::PlanMessage)
            .internal(false)
            .with_meta("plan", plan.to_json().to_string());
        self.state.plan = Some(plan);
        self.record(msg);
    }

    /// 计划生成后：协作模式等用户确认，否则直接执行
    fn after_plan(&mut self) -> Next {
        if self.config.cooperative_planning && self.user_agent.is_some() {
            self.state.mode = Mode::Planning;
            Next::AskUser(APPROVAL_REQUEST.to_string())
        } else {
            self.enter_execution()
        }
    }

    fn enter_execution(&mut self) -> Next {
        let user = self.user_source();
        self.state.message_history.retain(|m| m.source != user);
        self.state.mode = Mode::Execution;

        let plan_text = self
            .state
            .plan
            .as_ref()
            .map(Plan::render)
            .unwrap_or_default();
        let ledger = ChatMessage::new(
            &self.name,
            prompts::task_ledger(&self.state.task, &self.roster.describe(), &plan_text),
        )
        .with_kind(MessageKind::TaskLedger)
        .internal(true);
        self.record(ledger);

        tracing::info!(step = self.state.current_step_index, "Entering execution");
        Next::Round { first_step: true }
    }

    async fn ask_user(&mut self, prompt: &str) -> Result<Next, OrchestratorError> {
        let Some(user) = self.user_agent.clone() else {
            return Ok(Next::Idle);
        };
        let request = ChatMessage::new(&self.name, prompt)
            .with_kind(MessageKind::UserRequest)
            .internal(false);
        self.bus.publish_message(request.clone());

        match self.agent_turn(&user, request).await {
            Ok(reply) => Ok(Next::HandleUser(reply)),
            Err(OrchestratorError::Agent(e)) => {
                tracing::info!(error = %e, "User input unavailable, stopping");
                Ok(Next::Stop(StopSignal::completed(format!(
                    "User input unavailable: {}",
                    e
                ))))
            }
            Err(e) => Err(e),
        }
    }

    // ---- 执行 ----

    async fn execution_round(&mut self, first_step: bool) -> Result<Next, OrchestratorError> {
        let plan = self
            .state
            .plan
            .clone()
            .ok_or(OrchestratorError::MissingPlan)?;
        if self.state.current_step_index >= plan.len() {
            return Ok(Next::Finalize("Plan completed.".to_string()));
        }
        if self.state.round_count >= self.config.max_turns {
            return Ok(Next::Finalize("Max rounds reached.".to_string()));
        }

        let ledger = self.progress_ledger(&plan).await?;
        self.state.round_count += 1;
        tracing::debug!(
            round = self.state.round_count,
            step = self.state.current_step_index,
            complete = ledger.step_complete.answer,
            replan = ledger.need_replan.answer,
            agent = %ledger.next_instruction.agent_name,
            "Progress ledger"
        );
        self.bus.publish_message(
            ChatMessage::new(
                &self.name,
                serde_json::to_string(&ledger).unwrap_or_default(),
            )
            .with_kind(MessageKind::ProgressLedger)
            .internal(true),
        );

        if !first_step {
            if ledger.need_replan.answer {
                let reason = ledger.need_replan.reason.as_str();
                if !self.config.allow_for_replans {
                    return Ok(Next::Finalize(format!(
                        "The current plan failed to complete the task, we need a new plan to continue. {}",
                        reason
                    )));
                }
                if let Some(max) = self.config.max_replans {
                    if self.state.replan_count >= max {
                        return Ok(Next::Finalize(format!(
                            "We need to replan but max replan attempts reached: {}.",
                            reason
                        )));
                    }
                }
                return self.replan(&plan, reason).await;
            }
            if ledger.step_complete.answer {
                self.state.current_step_index += 1;
                self.sentinel_run = None;
            }
        }

        self.state.collect(&ledger.progress_summary);

        let index = self.state.current_step_index;
        let Some(step) = plan.get(index) else {
            return Ok(Next::Finalize("Plan completed.".to_string()));
        };
        self.check_roster(step.agent_name())?;

        let instruction = &ledger.next_instruction;
        let record = serde_json::json!({
            "title": step.title(),
            "index": index,
            "details": step.details(),
            "agent_name": instruction.agent_name,
            "instruction": instruction.answer,
            "progress_summary": ledger.progress_summary,
            "plan_length": plan.len(),
        });
        self.bus.publish_message(
            ChatMessage::new(&self.name, record.to_string())
                .with_kind(MessageKind::StepExecution)
                .internal(false),
        );

        match step {
            Step::Sentinel(sentinel) if self.config.sentinel.enable_sentinel_steps => {
                let reuse = self
                    .sentinel_run
                    .as_ref()
                    .is_some_and(|ctx| ctx.step_index == index);
                if !reuse {
                    let ctx = SentinelRunContext::new(index, instruction.answer.clone());
                    self.bus.publish_message(
                        ChatMessage::new(
                            &self.name,
                            format!(
                                "Starting sentinel step '{}': repeat until {} (every {}s).",
                                sentinel.title, sentinel.condition, sentinel.sleep_duration
                            ),
                        )
                        .with_kind(MessageKind::SentinelStart)
                        .internal(false)
                        .with_meta(crate::team::META_SENTINEL_ID, ctx.run_id.clone()),
                    );
                    self.sentinel_run = Some(ctx);
                }
                Ok(Next::Sentinel)
            }
            _ => self.dispatch(index, step, instruction).await,
        }
    }

    async fn progress_ledger(&self, plan: &Plan) -> Result<ProgressLedger, OrchestratorError> {
        let mut context = self.base_context();
        context.push(Message::user(prompts::progress_ledger_prompt(
            &self.state.task,
            &plan.render(),
            self.state.current_step_index,
            &self.roster.describe(),
            &self.roster.names(),
            self.config.autonomous_execution,
            &ProgressLedger::schema_json(),
        )));
        let roster = &self.roster;
        self.responder
            .get_structured_response(
                &context,
                |v| ProgressLedger::validate(v, roster),
                self.config.max_json_retries,
            )
            .await
    }

    /// 下发普通步骤并等待代理的一个回合
    async fn dispatch(
        &mut self,
        index: usize,
        step: &Step,
        instruction: &NextInstruction,
    ) -> Result<Next, OrchestratorError> {
        let target = instruction.agent_name.as_str();
        self.check_roster(target)?;

        let msg = ChatMessage::new(
            &self.name,
            prompts::step_instruction(index, step, target, &instruction.answer),
        )
        .internal(true);
        self.record(msg.clone());

        if target == NO_ACTION_AGENT {
            return Ok(Next::Round { first_step: false });
        }

        match self.agent_turn(target, msg).await {
            Ok(_) => {}
            Err(OrchestratorError::Agent(e)) => {
                tracing::warn!(agent = target, error = %e, "Agent turn failed");
                self.record(ChatMessage::new(target, format!("Error: {}", e)));
            }
            Err(e) => return Err(e),
        }
        Ok(Next::Round { first_step: false })
    }

    /// 一个代理回合：所有事件写入历史，返回最终响应。只有取消会打断回合
    async fn agent_turn(
        &mut self,
        agent: &str,
        instruction: ChatMessage,
    ) -> Result<ChatMessage, OrchestratorError> {
        let cancel = self.signals.cancel_token();
        let mut turn = self.bus.request_turn(agent, instruction, cancel.clone())?;
        let mut final_msg = None;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::Interrupted),
                item = turn.next() => item,
            };
            match item {
                None => break,
                Some(Ok(AgentEvent::Inner(m))) => self.record(m),
                Some(Ok(AgentEvent::Final(m))) => {
                    self.record(m.clone());
                    final_msg = Some(m);
                }
                Some(Err(AgentError::Cancelled)) => return Err(OrchestratorError::Interrupted),
                Some(Err(e)) => return Err(e.into()),
            }
        }
        final_msg.ok_or_else(|| {
            AgentError::Failed(format!("`{}` ended its turn without a final response", agent))
                .into()
        })
    }

    async fn replan(&mut self, plan: &Plan, reason: &str) -> Result<Next, OrchestratorError> {
        self.bus.publish_message(
            ChatMessage::new(
                &self.name,
                format!("We need to create a new plan. {}", reason),
            )
            .with_kind(MessageKind::Replanning)
            .internal(false),
        );

        let done = self.state.current_step_index.min(plan.len());
        let mut context = self.base_context();
        context.push(Message::user(prompts::replan_prompt(
            &self.state.task,
            &self.roster.describe(),
            &plan.steps[..done],
            reason,
            &plan.render(),
            &PlanDecision::schema_json(),
            self.config.sentinel.enable_sentinel_steps,
        )));

        let task = self.state.task.clone();
        let decision = self
            .responder
            .get_structured_response(
                &context,
                |v| PlanDecision::validate(v, &task),
                self.config.max_json_retries,
            )
            .await?;

        self.state.replan_count += 1;
        self.sentinel_run = None;
        tracing::info!(
            replans = self.state.replan_count,
            kept = done,
            new_steps = decision.plan.len(),
            "Replanned"
        );

        if decision.plan.is_empty() && done == 0 {
            self.state.plan = Some(plan.splice(0, Vec::new()));
            return Ok(Next::Finalize(
                "Replanning resulted in no additional steps needed; the task is treated as complete."
                    .to_string(),
            ));
        }

        let new_plan = plan.splice(done, decision.plan.steps);
        self.adopt_plan(new_plan, &format!("Replanning: {}", decision.plan_summary));
        Ok(self.after_plan())
    }

    async fn run_sentinel(&mut self) -> Result<Next, OrchestratorError> {
        let index = self.state.current_step_index;
        let step = match self.state.plan.as_ref().and_then(|p| p.get(index)) {
            Some(Step::Sentinel(s)) => s.clone(),
            _ => return Ok(Next::Round { first_step: false }),
        };
        let mut ctx = match self.sentinel_run.take() {
            Some(ctx) if ctx.step_index == index => ctx,
            _ => SentinelRunContext::new(index, step.details.clone()),
        };

        let executor = SentinelExecutor {
            name: &self.name,
            bus: &self.bus,
            responder: &self.responder,
            signals: &self.signals,
            config: &self.config.sentinel,
            max_json_retries: self.config.max_json_retries,
        };
        match executor.run(&step, &mut ctx, &mut self.state).await {
            Ok(SentinelOutcome::Completed { .. }) => {
                self.state.current_step_index += 1;
                Ok(Next::Round { first_step: false })
            }
            Ok(SentinelOutcome::Aborted { .. }) => Ok(Next::Round { first_step: false }),
            Err(e) => {
                if e.is_interrupt() {
                    self.sentinel_run = Some(ctx);
                }
                Err(e)
            }
        }
    }

    // ---- 收尾 ----

    async fn prepare_final_answer(&mut self, reason: &str) -> Result<Next, OrchestratorError> {
        tracing::info!(reason, "Preparing final answer");
        let mut context = self.base_context();
        context.push(Message::user(format!(
            "{}\n\nProgress Summary:\n{}\n\n{}",
            reason,
            self.state.information_collected,
            prompts::final_answer_prompt(
                &self.state.task,
                self.config.final_answer_prompt.as_deref()
            )
        )));

        let answer = self.responder.complete_once(&context).await?;
        let msg = ChatMessage::new(&self.name, prompts::wrap_final_answer(&answer))
            .with_kind(MessageKind::FinalAnswer)
            .internal(false);
        self.record(msg);
        Ok(self.finish_run(reason))
    }

    /// 最终答案之后：允许追问则保留历史等待用户，否则完全重置并以收尾原因停止
    fn finish_run(&mut self, reason: &str) -> Next {
        self.sentinel_run = None;
        self.resume = None;
        if self.config.allow_follow_up_input && self.user_agent.is_some() {
            self.state.reset_for_followup();
            Next::AskUser(FOLLOW_UP_REQUEST.to_string())
        } else {
            self.state.reset();
            Next::Stop(StopSignal::completed(reason))
        }
    }
}

/// 编排器句柄：向邮箱发命令；暂停/取消同时立即设置运行信号
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Command>,
    signals: RunSignals,
    snapshot: watch::Receiver<OrchestratorState>,
}

impl OrchestratorHandle {
    fn send(&self, cmd: Command) -> Result<(), OrchestratorError> {
        self.tx.send(cmd).map_err(|_| OrchestratorError::Closed)
    }

    pub fn start(&self, task: impl Into<String>) -> Result<(), OrchestratorError> {
        self.send(Command::Start(task.into()))
    }

    pub fn pause(&self) -> Result<(), OrchestratorError> {
        self.signals.pause();
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), OrchestratorError> {
        self.signals.resume();
        self.send(Command::Resume)
    }

    pub fn cancel(&self) -> Result<(), OrchestratorError> {
        self.signals.cancel();
        self.send(Command::Cancel)
    }

    /// 最近一次提交的状态快照；进行中的动作不计入，恢复时重做
    pub fn save_state(&self) -> OrchestratorState {
        self.snapshot.borrow().clone()
    }

    /// 载入状态；随后调用 `resume` 继续运行
    pub fn load_state(&self, state: OrchestratorState) -> Result<(), OrchestratorError> {
        self.send(Command::LoadState(Box::new(state)))
    }

    pub fn shutdown(&self) -> Result<(), OrchestratorError> {
        self.send(Command::Shutdown)
    }

    pub fn signals(&self) -> &RunSignals {
        &self.signals
    }
}
