//! 计划步骤：普通步骤与哨兵步骤

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PlanError;

/// 普通步骤：交给指定代理执行一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularStep {
    pub title: String,
    pub details: String,
    pub agent_name: String,
}

/// 哨兵条件：整数表示执行次数，文本表示需要模型判断的谓词
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SentinelCondition {
    Count(u32),
    Predicate(String),
}

impl std::fmt::Display for SentinelCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SentinelCondition::Count(n) => write!(f, "{} iterations", n),
            SentinelCondition::Predicate(text) => f.write_str(text),
        }
    }
}

/// 哨兵步骤：重复执行并睡眠，直到条件满足
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelStep {
    pub title: String,
    pub details: String,
    pub agent_name: String,
    pub condition: SentinelCondition,
    /// 两次检查之间的睡眠（秒）
    pub sleep_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step_type")]
pub enum Step {
    #[serde(rename = "PlanStep")]
    Regular(RegularStep),
    #[serde(rename = "SentinelPlanStep")]
    Sentinel(SentinelStep),
}

impl Step {
    pub fn title(&self) -> &str {
        match self {
            Step::Regular(s) => &s.title,
            Step::Sentinel(s) => &s.title,
        }
    }

    pub fn details(&self) -> &str {
        match self {
            Step::Regular(s) => &s.details,
            Step::Sentinel(s) => &s.details,
        }
    }

    pub fn agent_name(&self) -> &str {
        match self {
            Step::Regular(s) => &s.agent_name,
            Step::Sentinel(s) => &s.agent_name,
        }
    }

    pub fn as_sentinel(&self) -> Option<&SentinelStep> {
        match self {
            Step::Sentinel(s) => Some(s),
            Step::Regular(_) => None,
        }
    }

    /// 从模型/用户给出的 JSON 对象构造；缺少 `step_type` 视为普通步骤
    pub fn from_value(index: usize, value: &Value) -> Result<Step, PlanError> {
        let schema = |reason: String| PlanError::Schema { index, reason };
        let obj = value
            .as_object()
            .ok_or_else(|| schema("step must be an object".into()))?;

        let text_field = |key: &str| -> Result<String, PlanError> {
            match obj.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(schema(format!("`{}` must be a string", key))),
                None => Err(schema(format!("missing `{}`", key))),
            }
        };

        let title = text_field("title")?;
        let details = text_field("details")?;
        let agent_name = text_field("agent_name")?;
        if agent_name.trim().is_empty() {
            return Err(schema("`agent_name` must not be empty".into()));
        }

        let step_type = match obj.get("step_type") {
            None | Some(Value::Null) => "PlanStep",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(schema("`step_type` must be a string".into())),
        };

        match step_type {
            "PlanStep" => Ok(Step::Regular(RegularStep {
                title,
                details,
                agent_name,
            })),
            "SentinelPlanStep" => {
                let condition = parse_condition(obj.get("condition")).map_err(schema)?;
                let sleep_duration = parse_sleep(obj.get("sleep_duration")).map_err(schema)?;
                Ok(Step::Sentinel(SentinelStep {
                    title,
                    details,
                    agent_name,
                    condition,
                    sleep_duration,
                }))
            }
            other => Err(schema(format!("unknown step_type `{}`", other))),
        }
    }
}

fn parse_condition(value: Option<&Value>) -> Result<SentinelCondition, String> {
    match value {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(count) if count >= 1 => u32::try_from(count)
                .map(SentinelCondition::Count)
                .map_err(|_| "`condition` count is too large".to_string()),
            _ => Err("`condition` count must be a positive integer".into()),
        },
        Some(Value::String(s)) => {
            let text = s.trim();
            if text.is_empty() {
                return Err("`condition` must not be empty".into());
            }
            match text.parse::<i64>() {
                Ok(n) if n >= 1 => u32::try_from(n)
                    .map(SentinelCondition::Count)
                    .map_err(|_| "`condition` count is too large".to_string()),
                Ok(_) => Err("`condition` count must be a positive integer".into()),
                Err(_) => Ok(SentinelCondition::Predicate(text.to_string())),
            }
        }
        Some(_) => Err("`condition` must be an integer or text".into()),
        None => Err("missing `condition`".into()),
    }
}

fn parse_sleep(value: Option<&Value>) -> Result<u64, String> {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| "`sleep_duration` must be a non-negative integer".to_string()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| "`sleep_duration` must be a non-negative integer".to_string()),
        Some(_) => Err("`sleep_duration` must be a non-negative integer".into()),
        None => Err("missing `sleep_duration`".into()),
    }
}
