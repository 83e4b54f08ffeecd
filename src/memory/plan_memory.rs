//! 历史计划记忆：首次规划时检索与任务相关的已保存计划
//!
//! 当前实现为 InMemoryPlanMemory（关键词重叠打分），可替换为外部存储。

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;

/// 计划记忆 trait：按任务检索相关计划（已排序，最相关在前）
#[async_trait]
pub trait PlanMemory: Send + Sync {
    async fn retrieve_relevant(&self, task: &str) -> Result<Vec<String>, String>;
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

/// 一条已保存的计划：任务描述 + 计划 JSON
struct StoredPlan {
    task_tokens: HashSet<String>,
    plan_json: String,
}

/// 简单内存实现：按任务描述的关键词重叠检索
#[derive(Default)]
pub struct InMemoryPlanMemory {
    store: RwLock<Vec<StoredPlan>>,
}

impl InMemoryPlanMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存一条计划（plan_json 为 `{task, steps}` 或步骤数组）
    pub fn add(&self, task: &str, plan_json: impl Into<String>) {
        let task_tokens = tokenize_lower(task);
        if task_tokens.is_empty() {
            return;
        }
        if let Ok(mut store) = self.store.write() {
            store.push(StoredPlan {
                task_tokens,
                plan_json: plan_json.into(),
            });
        }
    }
}

#[async_trait]
impl PlanMemory for InMemoryPlanMemory {
    async fn retrieve_relevant(&self, task: &str) -> Result<Vec<String>, String> {
        let query = tokenize_lower(task);
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let store = self.store.read().map_err(|e| e.to_string())?;
        let mut scored: Vec<(usize, &str)> = store
            .iter()
            .map(|p| (query.intersection(&p.task_tokens).count(), p.plan_json.as_str()))
            .filter(|(s, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().map(|(_, p)| p.to_string()).collect())
    }
}
