//! 计划模型：任务 + 有序步骤
//!
//! 计划一旦进入执行就只读；重规划通过 `splice` 保留已完成的前缀、替换未执行的后缀。

mod step;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use step::{RegularStep, SentinelCondition, SentinelStep, Step};

/// 计划构造错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Schema error in step {index}: {reason}")]
    Schema { index: usize, reason: String },

    #[error("Plan is not valid JSON: {0}")]
    Json(String),

    #[error("Plan must be a list of steps or an object with `steps`")]
    Shape,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub task: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(task: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            task: task.into(),
            steps,
        }
    }

    /// 逐个校验步骤并构造计划；任意一步不合法即失败
    pub fn build(task: impl Into<String>, steps: &[Value]) -> Result<Plan, PlanError> {
        let steps = steps
            .iter()
            .enumerate()
            .map(|(i, v)| Step::from_value(i, v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Plan::new(task, steps))
    }

    /// 解析用户编辑或记忆中保存的计划：步骤数组、`{task, steps}` 对象，或包含二者之一的字符串
    pub fn from_json(value: &Value, default_task: &str) -> Result<Plan, PlanError> {
        match value {
            Value::Array(steps) => Plan::build(default_task, steps),
            Value::Object(obj) => {
                let steps = obj
                    .get("steps")
                    .and_then(Value::as_array)
                    .ok_or(PlanError::Shape)?;
                let task = obj
                    .get("task")
                    .and_then(Value::as_str)
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or(default_task);
                Plan::build(task, steps)
            }
            Value::String(text) => {
                let inner: Value =
                    serde_json::from_str(text).map_err(|e| PlanError::Json(e.to_string()))?;
                if inner.is_string() {
                    return Err(PlanError::Shape);
                }
                Plan::from_json(&inner, default_task)
            }
            _ => Err(PlanError::Shape),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// 确定性的文本形式（供模型上下文与展示）
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("Step {}: {}\n", i + 1, step.title()));
            if !step.details().is_empty() {
                out.push_str(&format!("{}\n", step.details()));
            }
            out.push_str(&format!("Agent: {}\n", step.agent_name()));
            if let Some(s) = step.as_sentinel() {
                out.push_str(&format!(
                    "Repeat until: {} (check every {}s)\n",
                    s.condition, s.sleep_duration
                ));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }

    /// 前 prefix_len 步原样保留，其后接上 suffix
    pub fn splice(&self, prefix_len: usize, suffix: Vec<Step>) -> Plan {
        let keep = prefix_len.min(self.steps.len());
        let mut steps = self.steps[..keep].to_vec();
        steps.extend(suffix);
        Plan::new(self.task.clone(), steps)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
