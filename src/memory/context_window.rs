//! 上下文窗口：按 token 上限裁剪发给模型的消息
//!
//! 保留开头的 system 消息与最后一条消息，其余从最旧的开始丢弃，直到估算值不超过上限。

use crate::memory::{Message, Role};

/// 每条消息的固定开销（role、分隔符）
const PER_MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let (ascii, non_ascii) = text.chars().fold((0usize, 0usize), |(a, n), c| {
            if c.is_ascii() {
                (a + 1, n)
            } else {
                (a, n + 1)
            }
        });
        let tokens = ascii / 4 + (non_ascii as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate(&m.content) + PER_MESSAGE_OVERHEAD)
            .sum()
    }
}

/// 上下文窗口：token 上限
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    token_limit: usize,
}

impl ContextWindow {
    pub fn new(token_limit: usize) -> Self {
        Self { token_limit }
    }

    pub fn token_limit(&self) -> usize {
        self.token_limit
    }

    /// 裁剪到上限以内；开头的 system 消息与最后一条消息总是保留
    pub fn trim(&self, messages: &[Message]) -> Vec<Message> {
        if TokenEstimator::estimate_messages(messages) <= self.token_limit || messages.len() <= 2 {
            return messages.to_vec();
        }

        let head = messages
            .iter()
            .take_while(|m| m.role == Role::System)
            .count()
            .min(messages.len() - 1);
        let (pinned, rest) = messages.split_at(head);
        let Some((last, middle)) = rest.split_last() else {
            return messages.to_vec();
        };

        let mut budget = self
            .token_limit
            .saturating_sub(TokenEstimator::estimate_messages(pinned))
            .saturating_sub(TokenEstimator::estimate_messages(std::slice::from_ref(last)));

        // 从最新往回保留
        let mut kept: Vec<&Message> = Vec::new();
        for m in middle.iter().rev() {
            let cost = TokenEstimator::estimate(&m.content) + PER_MESSAGE_OVERHEAD;
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(m);
        }
        kept.reverse();

        let dropped = middle.len() - kept.len();
        if dropped > 0 {
            tracing::debug!(dropped, limit = self.token_limit, "Context trimmed");
        }

        pinned
            .iter()
            .chain(kept)
            .chain(std::iter::once(last))
            .cloned()
            .collect()
    }
}
