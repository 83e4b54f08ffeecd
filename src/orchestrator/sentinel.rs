//! 哨兵步骤执行器
//!
//! 对同一个代理重复下发同一条指令，每次迭代后检查条件：
//! - 整数条件：迭代次数达到即满足
//! - 文本条件：交给模型判断「此刻」是否满足，可报告检查出错并建议下次间隔
//!
//! 连续出错达到上限则放弃该步骤（不影响整个运行）。未满足时睡眠，睡眠与暂停信号竞争。
//! 迭代计数只在条件判断完成后提交，因此被打断的迭代会在恢复后重做。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::config::SentinelSection;
use crate::memory::Message;
use crate::plan::{SentinelCondition, SentinelStep};
use crate::team::{
    AgentError, AgentEvent, BusError, ChatMessage, MessageBus, MessageKind, META_CHECK_NUMBER,
    META_SENTINEL_ID,
};

use super::ledger::SentinelCheck;
use super::state::OrchestratorState;
use super::{prompts, OrchestratorError, RunSignals, StructuredResponder};

/// 哨兵步骤完成/放弃时写入历史的合成消息来源
pub const SENTINEL_SOURCE: &str = "sentinel";

/// 单个哨兵步骤的运行上下文；步骤结束即丢弃，暂停期间由编排器保留
#[derive(Debug, Clone)]
pub struct SentinelRunContext {
    pub run_id: String,
    pub step_index: usize,
    /// 进度账本给出的指令
    pub instruction: String,
    pub iteration_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub saved_agent_snapshot: Option<Value>,
    pub consecutive_error_count: u32,
}

impl SentinelRunContext {
    pub fn new(step_index: usize, instruction: impl Into<String>) -> Self {
        Self {
            run_id: format!("sentinel_{}_{}", step_index, Uuid::new_v4().simple()),
            step_index,
            instruction: instruction.into(),
            iteration_count: 0,
            started_at: Utc::now(),
            last_check_at: None,
            saved_agent_snapshot: None,
            consecutive_error_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelOutcome {
    Completed { reason: String },
    Aborted { reason: String },
}

/// 一次条件判断的结果
struct Evaluation {
    met: bool,
    error: bool,
    reason: String,
    suggested_sleep: Option<u64>,
}

enum TurnOutcome {
    Reply(ChatMessage),
    Failed(String),
}

pub struct SentinelExecutor<'a> {
    pub name: &'a str,
    pub bus: &'a MessageBus,
    pub responder: &'a StructuredResponder,
    pub signals: &'a RunSignals,
    pub config: &'a SentinelSection,
    pub max_json_retries: u32,
}

impl SentinelExecutor<'_> {
    pub async fn run(
        &self,
        step: &SentinelStep,
        ctx: &mut SentinelRunContext,
        state: &mut OrchestratorState,
    ) -> Result<SentinelOutcome, OrchestratorError> {
        loop {
            if self.signals.is_interrupted() {
                return Err(OrchestratorError::Interrupted);
            }
            let iteration = ctx.iteration_count + 1;
            let now = Utc::now();
            tracing::debug!(
                run = %ctx.run_id,
                iteration,
                elapsed_secs = (now - ctx.started_at).num_seconds(),
                since_last_check_secs = ctx.last_check_at.map(|t| (now - t).num_seconds()),
                "Sentinel iteration"
            );

            if iteration > 1 {
                if let Some(snapshot) = &ctx.saved_agent_snapshot {
                    if let Err(e) = self
                        .bus
                        .load_agent_state(&step.agent_name, snapshot.clone())
                        .await
                    {
                        tracing::warn!(agent = %step.agent_name, error = %e, "Failed to restore agent snapshot");
                    }
                }
            }

            let turn = self.agent_turn(step, ctx, iteration, state).await?;

            if iteration == 1 && ctx.saved_agent_snapshot.is_none() {
                match self.bus.save_agent_state(&step.agent_name).await {
                    Ok(snapshot) => ctx.saved_agent_snapshot = Some(snapshot),
                    Err(BusError::Agent(AgentError::StateUnsupported(_))) => {}
                    Err(e) => {
                        tracing::warn!(agent = %step.agent_name, error = %e, "Failed to snapshot agent")
                    }
                }
            }

            let eval = match turn {
                TurnOutcome::Failed(reason) => Evaluation {
                    met: false,
                    error: true,
                    reason,
                    suggested_sleep: None,
                },
                TurnOutcome::Reply(last) => self.evaluate(step, iteration, &last, state).await?,
            };

            ctx.iteration_count = iteration;
            ctx.last_check_at = Some(Utc::now());

            if eval.error {
                ctx.consecutive_error_count += 1;
                tracing::warn!(
                    run = %ctx.run_id,
                    errors = ctx.consecutive_error_count,
                    reason = %eval.reason,
                    "Sentinel check error"
                );
                if ctx.consecutive_error_count >= self.config.max_consecutive_errors.max(1) {
                    self.publish(
                        ctx,
                        MessageKind::SentinelError,
                        format!(
                            "Sentinel step '{}' aborted after {} consecutive errors: {}",
                            step.title, ctx.consecutive_error_count, eval.reason
                        ),
                    );
                    record(
                        self.bus,
                        state,
                        ChatMessage::new(
                            SENTINEL_SOURCE,
                            format!(
                                "Sentinel step '{}' aborted due to repeated errors during condition checks. Last error: {}",
                                step.title, eval.reason
                            ),
                        ),
                    );
                    return Ok(SentinelOutcome::Aborted {
                        reason: eval.reason,
                    });
                }
            } else {
                ctx.consecutive_error_count = 0;
            }

            if eval.met {
                tracing::info!(run = %ctx.run_id, iterations = iteration, "Sentinel condition met");
                self.publish(
                    ctx,
                    MessageKind::SentinelComplete,
                    format!(
                        "Sentinel step '{}' completed after {} checks: {}",
                        step.title, iteration, eval.reason
                    ),
                );
                record(
                    self.bus,
                    state,
                    ChatMessage::new(
                        SENTINEL_SOURCE,
                        format!(
                            "Sentinel step '{}' completed successfully. Reason: {}",
                            step.title, eval.reason
                        ),
                    ),
                );
                return Ok(SentinelOutcome::Completed {
                    reason: eval.reason,
                });
            }

            let mut sleep_secs = match eval.suggested_sleep {
                Some(secs) if self.config.dynamic_sentinel_sleep => secs,
                _ => step.sleep_duration,
            };
            if eval.error {
                sleep_secs = sleep_secs.min(self.config.error_sleep_cap_secs);
            }
            self.publish(
                ctx,
                MessageKind::SentinelCheck,
                format!(
                    "Check {}: condition not met yet. {} Next check in {}s.",
                    iteration, eval.reason, sleep_secs
                ),
            );

            if sleep_secs > 0 {
                tokio::select! {
                    biased;
                    _ = self.signals.interrupted() => {
                        self.publish(
                            ctx,
                            MessageKind::SentinelPaused,
                            format!("Sentinel step '{}' paused after {} checks.", step.title, iteration),
                        );
                        return Err(OrchestratorError::Interrupted);
                    }
                    _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
                }
            }
        }
    }

    /// 一次代理回合；事件带上哨兵 id 与检查序号写入历史。暂停或取消立即打断回合
    async fn agent_turn(
        &self,
        step: &SentinelStep,
        ctx: &SentinelRunContext,
        iteration: u32,
        state: &mut OrchestratorState,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let content = prompts::sentinel_instruction(step, &ctx.instruction, &state.information_collected);
        let instruction = self.tag(ChatMessage::new(self.name, content), ctx, iteration);
        let mut turn =
            self.bus
                .request_turn(&step.agent_name, instruction, self.signals.cancel_token())?;

        let mut last = None;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.signals.interrupted() => return Err(OrchestratorError::Interrupted),
                item = turn.next() => item,
            };
            match item {
                None => break,
                Some(Ok(event)) => {
                    let is_final = matches!(event, AgentEvent::Final(_));
                    let msg = self.tag(event.into_message(), ctx, iteration);
                    record(self.bus, state, msg.clone());
                    if is_final {
                        last = Some(msg);
                    }
                }
                Some(Err(AgentError::Cancelled)) => return Err(OrchestratorError::Interrupted),
                Some(Err(e)) => return Ok(TurnOutcome::Failed(e.to_string())),
            }
        }
        Ok(match last {
            Some(msg) => TurnOutcome::Reply(msg),
            None => TurnOutcome::Failed(format!(
                "`{}` ended its turn without a final response",
                step.agent_name
            )),
        })
    }

    async fn evaluate(
        &self,
        step: &SentinelStep,
        iteration: u32,
        last: &ChatMessage,
        state: &OrchestratorState,
    ) -> Result<Evaluation, OrchestratorError> {
        match &step.condition {
            SentinelCondition::Count(target) => Ok(Evaluation {
                met: iteration >= *target,
                error: false,
                reason: format!("Completed {} of {} iterations.", iteration, target),
                suggested_sleep: None,
            }),
            SentinelCondition::Predicate(_) => {
                let context = vec![
                    Message::user(format!(
                        "Progress until this step: {}",
                        state.information_collected
                    )),
                    last.to_llm(self.name),
                    Message::user(prompts::sentinel_check_prompt(
                        step,
                        &SentinelCheck::schema_json(),
                        self.config.dynamic_sentinel_sleep,
                    )),
                ];
                let check = self
                    .responder
                    .get_structured_response(&context, SentinelCheck::validate, self.max_json_retries)
                    .await?;
                if let Some(why) = &check.sleep_duration_reason {
                    tracing::debug!(suggested = ?check.sleep_duration, reason = %why, "Sentinel sleep suggestion");
                }
                Ok(Evaluation {
                    met: check.condition_met && !check.error_encountered,
                    error: check.error_encountered,
                    reason: check.reason,
                    suggested_sleep: check.sleep_duration,
                })
            }
        }
    }

    fn tag(&self, msg: ChatMessage, ctx: &SentinelRunContext, iteration: u32) -> ChatMessage {
        msg.with_meta(META_SENTINEL_ID, ctx.run_id.clone())
            .with_meta(META_CHECK_NUMBER, iteration.to_string())
    }

    fn publish(&self, ctx: &SentinelRunContext, kind: MessageKind, content: String) {
        let msg = ChatMessage::new(self.name, content)
            .with_kind(kind)
            .internal(false)
            .with_meta(META_SENTINEL_ID, ctx.run_id.clone())
            .with_meta(META_CHECK_NUMBER, ctx.iteration_count.to_string());
        self.bus.publish_message(msg);
    }
}

fn record(bus: &MessageBus, state: &mut OrchestratorState, msg: ChatMessage) {
    state.message_history.push(msg.clone());
    bus.publish_message(msg);
}
