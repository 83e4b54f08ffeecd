//! 结构化记录：进度账本、规划响应、哨兵条件检查
//!
//! 每种记录都有显式校验函数，供结构化响应协议在重试循环里调用。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::Plan;

use super::Roster;

/// 是/否判断及理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Judgement {
    pub reason: String,
    pub answer: bool,
}

/// 下一条指令及执行它的代理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NextInstruction {
    pub answer: String,
    pub agent_name: String,
}

/// 每轮的进度账本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressLedger {
    #[serde(rename = "is_current_step_complete")]
    pub step_complete: Judgement,
    #[serde(rename = "need_to_replan")]
    pub need_replan: Judgement,
    #[serde(rename = "instruction_or_question")]
    pub next_instruction: NextInstruction,
    pub progress_summary: String,
}

impl ProgressLedger {
    /// 字段完整且 agent_name 在名册中
    pub fn validate(value: &Value, roster: &Roster) -> Result<Self, String> {
        let ledger: ProgressLedger =
            serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        let agent = &ledger.next_instruction.agent_name;
        if !roster.contains(agent) {
            return Err(format!(
                "`instruction_or_question.agent_name` is `{}`, it must be one of: {}",
                agent,
                roster.names().join(", ")
            ));
        }
        Ok(ledger)
    }

    pub fn schema_json() -> String {
        schema_string(schemars::schema_for!(ProgressLedger))
    }
}

/// 规划调用的原始响应（步骤另行校验）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanResponse {
    pub task: String,
    /// 步骤对象数组；哨兵步骤带 `step_type: "SentinelPlanStep"`、`condition`、`sleep_duration`
    pub steps: Vec<Value>,
    pub needs_plan: bool,
    pub response: String,
    pub plan_summary: String,
}

/// 校验后的规划结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDecision {
    pub task: String,
    pub needs_plan: bool,
    pub response: String,
    pub plan_summary: String,
    pub plan: Plan,
}

impl PlanDecision {
    pub fn validate(value: &Value, default_task: &str) -> Result<Self, String> {
        let raw: PlanResponse = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        let task = if raw.task.trim().is_empty() {
            default_task.to_string()
        } else {
            raw.task
        };
        let plan = Plan::build(task.clone(), &raw.steps).map_err(|e| e.to_string())?;
        Ok(Self {
            task,
            needs_plan: raw.needs_plan,
            response: raw.response,
            plan_summary: raw.plan_summary,
            plan,
        })
    }

    pub fn schema_json() -> String {
        schema_string(schemars::schema_for!(PlanResponse))
    }
}

/// 哨兵文本条件的检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SentinelCheck {
    pub reason: String,
    pub condition_met: bool,
    /// 代理没能有效完成检查（页面打不开、工具报错等）
    #[serde(default)]
    pub error_encountered: bool,
    /// 建议的下次检查间隔（秒）
    #[serde(default)]
    pub sleep_duration: Option<u64>,
    #[serde(default)]
    pub sleep_duration_reason: Option<String>,
}

impl SentinelCheck {
    pub fn validate(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }

    pub fn schema_json() -> String {
        schema_string(schemars::schema_for!(SentinelCheck))
    }
}

fn schema_string(schema: schemars::schema::RootSchema) -> String {
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
