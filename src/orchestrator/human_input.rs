//! 用户在协作规划阶段的回复：纯文本，或 `{content, accepted?, plan?}` JSON

use serde_json::Value;

const ACCEPT_PHRASES: &[&str] = &[
    "accept",
    "accepted",
    "approve",
    "approved",
    "yes",
    "y",
    "ok",
    "okay",
    "lgtm",
    "proceed",
    "go ahead",
    "looks good",
    "sounds good",
];

/// 是否为表示接受计划的短语（忽略大小写与结尾标点）
pub fn is_accepted_str(text: &str) -> bool {
    let normalized = text
        .trim()
        .trim_end_matches(['.', '!', ','])
        .trim()
        .to_lowercase();
    ACCEPT_PHRASES.contains(&normalized.as_str())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HumanInput {
    pub content: String,
    pub accepted: bool,
    /// 用户编辑后的计划（原样 JSON，由 Plan::from_json 解析）
    pub plan: Option<Value>,
}

impl HumanInput {
    pub fn parse(text: &str) -> Self {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text.trim()) {
            if let Some(content) = obj.get("content").and_then(Value::as_str) {
                let accepted = match obj.get("accepted") {
                    Some(Value::Bool(b)) => *b,
                    Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
                    _ => false,
                } || is_accepted_str(content);
                let plan = obj.get("plan").filter(|p| !p.is_null()).cloned();
                return Self {
                    content: content.to_string(),
                    accepted,
                    plan,
                };
            }
        }
        Self {
            content: text.to_string(),
            accepted: is_accepted_str(text),
            plan: None,
        }
    }
}
