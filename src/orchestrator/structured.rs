//! 结构化响应：向模型索取 JSON，校验，失败则追加纠正指令重试
//!
//! 每次尝试前检查暂停/取消；模型调用本身与中断信号竞争。解析失败时先剥离 ```json 代码块，
//! 再做括号配平提取第一个完整的 JSON 对象。

use std::sync::Arc;

use serde_json::Value;

use crate::llm::LlmClient;
use crate::memory::{ContextWindow, Message};

use super::{OrchestratorError, RunSignals};

pub struct StructuredResponder {
    llm: Arc<dyn LlmClient>,
    window: ContextWindow,
    signals: RunSignals,
}

impl StructuredResponder {
    pub fn new(llm: Arc<dyn LlmClient>, window: ContextWindow, signals: RunSignals) -> Self {
        Self {
            llm,
            window,
            signals,
        }
    }

    /// 单次模型调用（无重试），与中断竞争
    pub async fn complete_once(&self, context: &[Message]) -> Result<String, OrchestratorError> {
        if self.signals.is_interrupted() {
            return Err(OrchestratorError::Interrupted);
        }
        let trimmed = self.window.trim(context);
        tokio::select! {
            biased;
            _ = self.signals.interrupted() => Err(OrchestratorError::Interrupted),
            res = self.llm.complete(&trimmed) => Ok(res?.content),
        }
    }

    /// 最多 `max_retries` 次模型调用（0 按 1 计）；耗尽后返回 LedgerProtocolExhausted
    pub async fn get_structured_response<T, F>(
        &self,
        context: &[Message],
        validate: F,
        max_retries: u32,
    ) -> Result<T, OrchestratorError>
    where
        F: Fn(&Value) -> Result<T, String>,
    {
        let attempts = max_retries.max(1);
        let mut context = context.to_vec();
        let mut last_error = String::new();
        let mut last_response = String::new();

        for attempt in 1..=attempts {
            if self.signals.is_interrupted() {
                return Err(OrchestratorError::Interrupted);
            }
            let trimmed = self.window.trim(&context);
            let completion = tokio::select! {
                biased;
                _ = self.signals.interrupted() => return Err(OrchestratorError::Interrupted),
                res = self.llm.complete(&trimmed) => res,
            };

            let content = match completion {
                Ok(c) => c.content,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Model call failed, retrying");
                    last_error = e.to_string();
                    continue;
                }
            };
            last_response = content.clone();

            let correction = match parse_json(&content) {
                Ok(value) => match validate(&value) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => {
                        tracing::debug!(attempt, error = %e, "Structured response failed validation");
                        last_error = e;
                        format!(
                            "Validation failed for JSON response, retrying: {}. \
                             You must return a valid JSON object matching the requested schema.",
                            last_error
                        )
                    }
                },
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Structured response is not JSON");
                    last_error = e;
                    format!(
                        "Failed to parse JSON response, retrying... Error: {}. \
                         Reply with a single JSON object and nothing else.",
                        last_error
                    )
                }
            };
            context.push(Message::assistant(content));
            context.push(Message::user(correction));
        }

        tracing::warn!(attempts, "Structured response retries exhausted");
        Err(OrchestratorError::LedgerProtocolExhausted {
            attempts,
            last_error,
            last_response,
        })
    }
}

/// 解析模型输出为 JSON：整体解析，其次 ```json 代码块，最后括号配平提取
pub fn parse_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    let direct_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => return Ok(v),
        Err(e) => e.to_string(),
    };

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        if let Ok(v) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(v);
        }
    }

    extract_json_object(trimmed).ok_or(direct_err)
}

/// 找到第一个能完整解析的 `{...}` 片段（忽略字符串中的括号）
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&bytes[start..]) {
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&text[start..=start + end]) {
                return Some(v);
            }
        }
        search_from = start + 1;
    }
    None
}

fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
