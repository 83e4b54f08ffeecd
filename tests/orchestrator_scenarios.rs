//! 编排器端到端场景：脚本化 Mock LLM + 记录型代理

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use orca::config::{OrchestratorConfig, PlanRetrieval};
use orca::llm::MockLlmClient;
use orca::memory::InMemoryPlanMemory;
use orca::orchestrator::{Mode, OrchestratorState, USER_AGENT};
use orca::plan::Plan;
use orca::team::{
    AgentError, AgentEvent, AgentStream, ChatMessage, MessageKind, StopSignal, TeamBuilder,
    TeamEvent, WorkerAgent,
};

type Log = Arc<Mutex<Vec<(String, String)>>>;

/// 记录收到的每条指令并给出固定回复
struct Recorder {
    name: String,
    log: Log,
}

impl Recorder {
    fn new(name: &str, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
        })
    }
}

#[async_trait]
impl WorkerAgent for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "does whatever it is told"
    }

    async fn handle(
        &self,
        instruction: ChatMessage,
        _cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        self.log
            .lock()
            .unwrap()
            .push((self.name.clone(), instruction.content));
        let reply = ChatMessage::new(&self.name, format!("{} did it", self.name));
        Ok(Box::pin(stream::iter([AgentEvent::Final(reply)])))
    }
}

/// 按顺序给出预设回复的用户代理
struct ScriptedUser {
    replies: Mutex<Vec<String>>,
    log: Log,
}

#[async_trait]
impl WorkerAgent for ScriptedUser {
    fn name(&self) -> &str {
        USER_AGENT
    }

    fn description(&self) -> &str {
        "the human"
    }

    async fn handle(
        &self,
        instruction: ChatMessage,
        _cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        self.log
            .lock()
            .unwrap()
            .push((USER_AGENT.to_string(), instruction.content));
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(AgentError::InputClosed);
        }
        let reply = ChatMessage::new(USER_AGENT, replies.remove(0));
        Ok(Box::pin(stream::iter([AgentEvent::Final(reply)])))
    }
}

/// 永不回复，只能被取消
struct Blocker;

#[async_trait]
impl WorkerAgent for Blocker {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "takes forever"
    }

    async fn handle(
        &self,
        _instruction: ChatMessage,
        _cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        Ok(Box::pin(stream::pending()))
    }
}

/// 永不回复的用户代理，只能被取消
struct SilentUser;

#[async_trait]
impl WorkerAgent for SilentUser {
    fn name(&self) -> &str {
        USER_AGENT
    }

    fn description(&self) -> &str {
        "a human who walked away"
    }

    async fn handle(
        &self,
        _instruction: ChatMessage,
        cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        cancel.cancelled().await;
        Err(AgentError::Cancelled)
    }
}

/// 记录回合与快照调用顺序的代理
struct Snapshotter {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl WorkerAgent for Snapshotter {
    fn name(&self) -> &str {
        "a"
    }

    fn description(&self) -> &str {
        "keeps state between turns"
    }

    async fn handle(
        &self,
        _instruction: ChatMessage,
        _cancel: CancellationToken,
    ) -> Result<AgentStream, AgentError> {
        self.calls.lock().unwrap().push("turn");
        let reply = ChatMessage::new("a", "looked");
        Ok(Box::pin(stream::iter([AgentEvent::Final(reply)])))
    }

    async fn save_state(&self) -> Result<Value, AgentError> {
        self.calls.lock().unwrap().push("save");
        Ok(json!({"seen": 1}))
    }

    async fn load_state(&self, state: Value) -> Result<(), AgentError> {
        assert_eq!(state, json!({"seen": 1}));
        self.calls.lock().unwrap().push("load");
        Ok(())
    }
}

fn autonomous() -> OrchestratorConfig {
    OrchestratorConfig {
        cooperative_planning: false,
        autonomous_execution: true,
        allow_follow_up_input: false,
        ..OrchestratorConfig::default()
    }
}

fn step(title: &str, agent: &str) -> Value {
    json!({"title": title, "details": format!("do {}", title), "agent_name": agent})
}

fn sentinel(agent: &str, condition: Value, sleep: u64) -> Value {
    json!({
        "title": "watch",
        "details": "keep watching",
        "agent_name": agent,
        "step_type": "SentinelPlanStep",
        "condition": condition,
        "sleep_duration": sleep
    })
}

fn plan(steps: Value) -> String {
    json!({
        "task": "the task",
        "steps": steps,
        "needs_plan": true,
        "response": "",
        "plan_summary": "summary"
    })
    .to_string()
}

fn ledger(complete: bool, replan: bool, agent: &str) -> String {
    json!({
        "is_current_step_complete": {"reason": "checked", "answer": complete},
        "need_to_replan": {"reason": "stuck", "answer": replan},
        "instruction_or_question": {"answer": "go on", "agent_name": agent},
        "progress_summary": "progress"
    })
    .to_string()
}

fn last_user_text(mock: &MockLlmClient, call: usize) -> String {
    mock.call(call)
        .and_then(|msgs| msgs.last().map(|m| m.content.clone()))
        .unwrap_or_default()
}

fn count_kind(messages: &[ChatMessage], kind: MessageKind) -> usize {
    messages.iter().filter(|m| m.kind() == Some(kind)).count()
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<TeamEvent>,
    mut pred: impl FnMut(&TeamEvent) -> bool,
) -> Vec<TeamEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            let hit = pred(&event);
            seen.push(event);
            if hit {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for event");
    seen
}

fn is_terminated(e: &TeamEvent) -> bool {
    matches!(e, TeamEvent::Terminated(_))
}

fn stop_of(events: &[TeamEvent]) -> Option<StopSignal> {
    events.iter().find_map(|e| match e {
        TeamEvent::Terminated(s) => Some(s.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn test_direct_answer_without_plan() {
    let mock = Arc::new(MockLlmClient::scripted([json!({
        "task": "What is 2+2?",
        "steps": [],
        "needs_plan": false,
        "response": "4",
        "plan_summary": ""
    })
    .to_string()]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("coder", &log))
        .build()
        .unwrap();

    let result = team.run("What is 2+2?").await.unwrap();
    assert_eq!(result.final_answer(), Some("4"));
    assert_eq!(result.stop, StopSignal::completed("Final answer provided"));
    assert_eq!(mock.call_count(), 1);
    assert_eq!(mock.remaining(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_steps_dispatched_in_order() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("one", "a"), step("two", "b"), step("three", "c")])),
        ledger(false, false, "a"),
        ledger(true, false, "b"),
        ledger(true, false, "c"),
        ledger(true, false, "c"),
        "All three done.".to_string(),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .with_agent(Recorder::new("b", &log))
        .with_agent(Recorder::new("c", &log))
        .build()
        .unwrap();

    let result = team.run("do three things").await.unwrap();
    assert_eq!(result.final_answer(), Some("All three done."));
    assert_eq!(result.stop, StopSignal::completed("Plan completed."));

    let log = log.lock().unwrap();
    let agents: Vec<_> = log.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(agents, ["a", "b", "c"]);
    assert!(log[0].1.starts_with("Step 1: one"));
    assert!(log[2].1.starts_with("Step 3: three"));
    assert_eq!(count_kind(&result.messages, MessageKind::StepExecution), 3);
    assert!(last_user_text(&mock, 5).contains("Plan completed."));
}

#[tokio::test]
async fn test_first_round_after_replan_ignores_flags() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("first", "a"), step("second", "a")])),
        ledger(false, false, "a"),
        ledger(false, true, "a"),
        plan(json!([step("other way", "a")])),
        // 重规划后的第一轮忽略判断
        ledger(false, true, "a"),
        ledger(true, false, "a"),
        "Done another way.".to_string(),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("Done another way."));
    assert_eq!(count_kind(&result.messages, MessageKind::Replanning), 1);
    assert_eq!(count_kind(&result.messages, MessageKind::PlanMessage), 2);
    assert_eq!(mock.call_count(), 7);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log[1].1.starts_with("Step 1: other way"));
}

#[tokio::test]
async fn test_second_replan_over_budget_finalizes() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("s1", "a"), step("s2", "a")])),
        ledger(false, false, "a"),
        ledger(false, true, "a"),
        plan(json!([step("retry", "a")])),
        ledger(false, false, "a"),
        ledger(false, true, "a"),
        "stopped after one replan".to_string(),
    ]));
    let log = Log::default();
    let config = OrchestratorConfig {
        max_replans: Some(1),
        ..autonomous()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("stopped after one replan"));
    assert_eq!(count_kind(&result.messages, MessageKind::Replanning), 1);
    assert_eq!(mock.call_count(), 7);
    assert!(last_user_text(&mock, 6).contains("max replan attempts reached"));
}

#[tokio::test]
async fn test_replan_keeps_completed_prefix() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("s1", "a"), step("s2", "a"), step("s3", "a")])),
        ledger(false, false, "a"),
        ledger(true, false, "a"),
        ledger(false, true, "a"),
        plan(json!([step("n1", "a")])),
        ledger(false, false, "a"),
        ledger(true, false, "a"),
        "ok".to_string(),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("ok"));

    let replan_prompt = last_user_text(&mock, 4);
    assert!(replan_prompt.contains("COMPLETED STEP 1: s1"));
    assert!(!replan_prompt.contains("COMPLETED STEP 2"));

    let last_plan = result
        .messages
        .iter()
        .rev()
        .find(|m| m.kind() == Some(MessageKind::PlanMessage))
        .and_then(|m| m.metadata.get("plan"))
        .map(|p| serde_json::from_str::<Plan>(p).unwrap())
        .unwrap();
    let titles: Vec<_> = last_plan.steps.iter().map(|s| s.title()).collect();
    assert_eq!(titles, ["s1", "n1"]);

    let log = log.lock().unwrap();
    assert!(log.last().unwrap().1.starts_with("Step 2: n1"));
}

#[tokio::test]
async fn test_replans_disallowed_finalizes() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("only", "a")])),
        ledger(false, false, "a"),
        ledger(false, true, "a"),
        "gave up".to_string(),
    ]));
    let log = Log::default();
    let config = OrchestratorConfig {
        allow_for_replans: false,
        ..autonomous()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("gave up"));
    assert!(last_user_text(&mock, 3).contains("we need a new plan to continue"));
    assert_eq!(count_kind(&result.messages, MessageKind::Replanning), 0);
}

#[tokio::test]
async fn test_round_budget() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("endless", "a")])),
        ledger(false, false, "a"),
        ledger(false, false, "a"),
        "partial".to_string(),
    ]));
    let log = Log::default();
    let config = OrchestratorConfig {
        max_turns: 2,
        ..autonomous()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("partial"));
    assert_eq!(result.stop, StopSignal::completed("Max rounds reached."));
    assert_eq!(log.lock().unwrap().len(), 2);
    assert!(last_user_text(&mock, 3).contains("Max rounds reached."));
}

#[tokio::test]
async fn test_sentinel_count_with_zero_sleep() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!(5), 0)])),
        ledger(false, false, "a"),
        "watched five times".to_string(),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("watched five times"));
    assert_eq!(mock.call_count(), 3);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 5);
    assert!(log[0].1.starts_with("Your high level goal: keep watching"));
    assert_eq!(count_kind(&result.messages, MessageKind::SentinelStart), 1);
    assert_eq!(count_kind(&result.messages, MessageKind::SentinelCheck), 4);
    assert_eq!(count_kind(&result.messages, MessageKind::SentinelComplete), 1);
}

#[tokio::test]
async fn test_sentinel_aborts_after_consecutive_errors() {
    let failed_check = json!({
        "reason": "page did not load",
        "condition_met": false,
        "error_encountered": true
    })
    .to_string();
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!("the build is green"), 0)])),
        ledger(false, false, "a"),
        failed_check.clone(),
        failed_check.clone(),
        failed_check,
        ledger(true, false, "a"),
        "could not confirm".to_string(),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("could not confirm"));
    assert_eq!(log.lock().unwrap().len(), 3);
    assert_eq!(count_kind(&result.messages, MessageKind::SentinelError), 1);
    assert!(result
        .messages
        .iter()
        .any(|m| m.source == "sentinel" && m.content.contains("aborted")));
    assert!(!result.stop.error);
}

#[tokio::test]
async fn test_pause_mid_sleep_and_resume() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!(3), 1)])),
        ledger(false, false, "a"),
        "three checks".to_string(),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();
    let handle = team.handle().clone();
    let mut events = team.subscribe();

    handle.start("task").unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::SentinelCheck))
    })
    .await;
    handle.pause().unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::SentinelPaused))
    })
    .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(log.lock().unwrap().len(), 1);

    let state = handle.save_state();
    assert_eq!(state.mode, Mode::Execution);
    assert_eq!(state.current_step_index, 0);

    handle.resume().unwrap();
    handle.resume().unwrap();
    let seen = wait_for(&mut events, is_terminated).await;
    assert_eq!(stop_of(&seen), Some(StopSignal::completed("Plan completed.")));
    // 被打断的是睡眠，已完成的迭代不重做
    assert_eq!(log.lock().unwrap().len(), 3);
    assert_eq!(mock.call_count(), 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_saved_state_resumes_in_new_team() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!(10), 1)])),
        ledger(false, false, "a"),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();
    let mut events = team.subscribe();
    team.handle().start("watch it").unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::SentinelCheck))
    })
    .await;
    team.handle().pause().unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::SentinelPaused))
    })
    .await;

    let saved = team.handle().save_state();
    let restored = OrchestratorState::from_json(&saved.to_json().unwrap()).unwrap();
    assert_eq!(restored.task, "watch it");
    assert_eq!(restored.round_count, 1);
    assert!(restored.plan.is_some());
    team.handle().shutdown().unwrap();

    let mock2 = Arc::new(MockLlmClient::scripted([
        ledger(true, false, "a"),
        "resumed and finished".to_string(),
    ]));
    let log2 = Log::default();
    let team2 = TeamBuilder::new(mock2.clone(), autonomous())
        .with_agent(Recorder::new("a", &log2))
        .build()
        .unwrap();
    let mut events2 = team2.subscribe();
    team2.handle().load_state(restored).unwrap();
    team2.handle().resume().unwrap();

    let seen = wait_for(&mut events2, is_terminated).await;
    assert_eq!(stop_of(&seen), Some(StopSignal::completed("Plan completed.")));
    assert_eq!(mock2.call_count(), 2);
    assert!(log2.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_step_agent_is_fatal() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("haunt", "ghost")])),
        ledger(false, false, "a"),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert!(result.stop.error);
    assert!(result.stop.reason.contains("ghost"));
    assert_eq!(count_kind(&result.messages, MessageKind::OrchestratorError), 1);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_is_not_an_error() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("wait", "slow")])),
        ledger(false, false, "slow"),
    ]));
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Arc::new(Blocker))
        .build()
        .unwrap();
    let mut events = team.subscribe();

    team.handle().start("task").unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::StepExecution))
    })
    .await;
    team.handle().cancel().unwrap();

    let seen = wait_for(&mut events, is_terminated).await;
    assert_eq!(stop_of(&seen), Some(StopSignal::completed("Cancelled")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
    assert!(!team.handle().signals().is_cancelled());
}

#[tokio::test]
async fn test_cooperative_plan_approval() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([step("build", "a")])),
        ledger(false, false, "a"),
        ledger(true, false, "a"),
        "built".to_string(),
    ]));
    let log = Log::default();
    let user = Arc::new(ScriptedUser {
        replies: Mutex::new(vec!["Looks good!".to_string()]),
        log: log.clone(),
    });
    let config = OrchestratorConfig {
        cooperative_planning: true,
        autonomous_execution: false,
        allow_follow_up_input: false,
        ..OrchestratorConfig::default()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .with_user_agent(user)
        .build()
        .unwrap();

    let result = team.run("build it").await.unwrap();
    assert_eq!(result.final_answer(), Some("built"));
    assert_eq!(count_kind(&result.messages, MessageKind::UserRequest), 1);

    let log = log.lock().unwrap();
    let agents: Vec<_> = log.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(agents, [USER_AGENT, "a"]);

    // 进入执行后用户消息不再出现在上下文中
    let ledger_context = mock.call(1).unwrap();
    assert!(ledger_context
        .iter()
        .all(|m| !m.content.starts_with(&format!("{}: ", USER_AGENT))));
}

#[tokio::test]
async fn test_missing_user_agent_rejected() {
    let mock = Arc::new(MockLlmClient::new());
    let err = TeamBuilder::new(mock, OrchestratorConfig::default())
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("user agent"));
}

#[tokio::test]
async fn test_reuse_mode_skips_planning_call() {
    let memory = Arc::new(InMemoryPlanMemory::new());
    memory.add(
        "summarize the weekly report",
        json!([step("summarize", "a")]).to_string(),
    );
    let mock = Arc::new(MockLlmClient::scripted([
        ledger(false, false, "a"),
        ledger(true, false, "a"),
        "summary written".to_string(),
    ]));
    let log = Log::default();
    let config = OrchestratorConfig {
        retrieve_relevant_plans: PlanRetrieval::Reuse,
        ..autonomous()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .with_memory(memory)
        .build()
        .unwrap();

    let result = team.run("summarize the monthly report").await.unwrap();
    assert_eq!(result.final_answer(), Some("summary written"));
    assert_eq!(mock.call_count(), 3);
    assert!(last_user_text(&mock, 0).contains("is_current_step_complete"));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_save_state_while_paused_user_turn_is_pending() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!(10), 5)])),
        ledger(false, false, "a"),
    ]));
    let log = Log::default();
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Recorder::new("a", &log))
        .with_user_agent(Arc::new(SilentUser))
        .build()
        .unwrap();
    let handle = team.handle().clone();
    let mut events = team.subscribe();

    handle.start("watch it").unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::SentinelCheck))
    })
    .await;
    handle.pause().unwrap();
    // 暂停后编排器把回合交给用户代理，而用户不会回复
    wait_for(&mut events, |e| {
        matches!(e, TeamEvent::Message(m) if m.kind() == Some(MessageKind::UserRequest))
    })
    .await;

    let saved = handle.save_state();
    assert!(saved.paused);
    assert_eq!(saved.task, "watch it");
    assert_eq!(saved.mode, Mode::Execution);
    assert_eq!(saved.round_count, 1);
    assert!(saved.plan.is_some());
    let restored = OrchestratorState::from_json(&saved.to_json().unwrap()).unwrap();
    assert_eq!(restored.current_step_index, 0);

    handle.cancel().unwrap();
    let seen = wait_for(&mut events, is_terminated).await;
    assert_eq!(stop_of(&seen), Some(StopSignal::completed("Cancelled")));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_sentinel_restores_agent_snapshot_each_iteration() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!(3), 0)])),
        ledger(false, false, "a"),
        "watched".to_string(),
    ]));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let team = TeamBuilder::new(mock.clone(), autonomous())
        .with_agent(Arc::new(Snapshotter {
            calls: calls.clone(),
        }))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("watched"));
    assert_eq!(
        *calls.lock().unwrap(),
        ["turn", "save", "load", "turn", "load", "turn"]
    );
}

#[tokio::test]
async fn test_follow_up_keeps_history() {
    let direct = |answer: &str| {
        json!({
            "task": "weather",
            "steps": [],
            "needs_plan": false,
            "response": answer,
            "plan_summary": ""
        })
        .to_string()
    };
    let mock = Arc::new(MockLlmClient::scripted([direct("sunny"), direct("rainy")]));
    let log = Log::default();
    let user = Arc::new(ScriptedUser {
        replies: Mutex::new(vec!["and tomorrow?".to_string()]),
        log: log.clone(),
    });
    let config = OrchestratorConfig {
        allow_follow_up_input: true,
        ..autonomous()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_user_agent(user)
        .build()
        .unwrap();

    let result = team.run("weather today?").await.unwrap();
    assert_eq!(result.final_answer(), Some("rainy"));
    assert_eq!(count_kind(&result.messages, MessageKind::FinalAnswer), 2);
    // 第二次追问时用户输入已关闭
    assert!(result.stop.reason.starts_with("User input unavailable"));
    assert!(!result.stop.error);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|(_, prompt)| prompt.contains("anything else")));

    let second = mock.call(1).unwrap();
    assert!(second.iter().any(|m| m.content.contains("weather today?")));
    assert!(second.iter().any(|m| m.content.contains("sunny")));
    assert!(second.iter().any(|m| m.content.contains("and tomorrow?")));
}

#[tokio::test]
async fn test_hint_mode_adds_remembered_plan_to_planning() {
    let memory = Arc::new(InMemoryPlanMemory::new());
    memory.add(
        "summarize the weekly report",
        json!([step("skim headings first", "a")]).to_string(),
    );
    let mock = Arc::new(MockLlmClient::scripted([json!({
        "task": "summarize the monthly report",
        "steps": [],
        "needs_plan": false,
        "response": "short",
        "plan_summary": ""
    })
    .to_string()]));
    let config = OrchestratorConfig {
        retrieve_relevant_plans: PlanRetrieval::Hint,
        ..autonomous()
    };
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &Log::default()))
        .with_memory(memory)
        .build()
        .unwrap();

    let result = team.run("summarize the monthly report").await.unwrap();
    assert_eq!(result.final_answer(), Some("short"));
    let planning = mock.call(0).unwrap();
    assert!(planning
        .iter()
        .any(|m| m.content.contains("similar task") && m.content.contains("skim headings first")));
}

fn check(met: bool, error: bool, sleep: Option<u64>) -> String {
    json!({
        "reason": "looked at the build",
        "condition_met": met,
        "error_encountered": error,
        "sleep_duration": sleep
    })
    .to_string()
}

fn check_delays(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.kind() == Some(MessageKind::SentinelCheck))
        .map(|m| m.content.clone())
        .collect()
}

#[tokio::test]
async fn test_dynamic_sentinel_sleep_uses_model_suggestion() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!("the build is green"), 100)])),
        ledger(false, false, "a"),
        check(false, false, Some(0)),
        check(true, false, None),
        "green".to_string(),
    ]));
    let log = Log::default();
    let mut config = autonomous();
    config.sentinel.dynamic_sentinel_sleep = true;
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("green"));
    let checks = check_delays(&result.messages);
    assert_eq!(checks.len(), 1);
    assert!(checks[0].ends_with("Next check in 0s."));
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_sleep_after_error_is_capped() {
    let mock = Arc::new(MockLlmClient::scripted([
        plan(json!([sentinel("a", json!("the build is green"), 100)])),
        ledger(false, false, "a"),
        check(false, true, Some(60)),
        check(true, false, None),
        "green after retry".to_string(),
    ]));
    let log = Log::default();
    let mut config = autonomous();
    config.sentinel.error_sleep_cap_secs = 0;
    let team = TeamBuilder::new(mock.clone(), config)
        .with_agent(Recorder::new("a", &log))
        .build()
        .unwrap();

    let result = team.run("task").await.unwrap();
    assert_eq!(result.final_answer(), Some("green after retry"));
    let checks = check_delays(&result.messages);
    assert_eq!(checks.len(), 1);
    assert!(checks[0].ends_with("Next check in 0s."));
    assert_eq!(count_kind(&result.messages, MessageKind::SentinelError), 0);
}
