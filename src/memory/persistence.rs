//! 状态持久化
//!
//! 将编排器状态写入/从 JSON 文件加载，用于进程重启后继续同一次运行。

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// 单文件 JSON 持久化
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 从 JSON 文件加载；文件不存在时返回 None
    pub fn load<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read state file {}", self.path.display()))?;
        let value = serde_json::from_str(&data)
            .with_context(|| format!("parse state file {}", self.path.display()))?;
        Ok(Some(value))
    }

    /// 写入 JSON 文件；父目录不存在时自动创建
    pub fn save<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("write state file {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "State saved");
        Ok(())
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
