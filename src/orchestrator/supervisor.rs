//! 运行信号：暂停与取消
//!
//! 句柄一侧设置，编排器在每个挂起点观察。暂停用 watch 通道（可等待变为 true），
//! 取消用 CancellationToken；一次取消被消费后换成新令牌，供下一次运行使用。

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunSignals {
    cancel: Arc<Mutex<CancellationToken>>,
    paused: Arc<watch::Sender<bool>>,
}

impl RunSignals {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            paused: Arc::new(paused),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token().is_cancelled()
    }

    /// 换一个未取消的新令牌
    pub fn reset_cancel(&self) {
        let fresh = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut t) => *t = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_interrupted(&self) -> bool {
        self.is_paused() || self.is_cancelled()
    }

    /// 暂停或取消发生时完成
    pub async fn interrupted(&self) {
        let token = self.cancel_token();
        let mut paused = self.paused.subscribe();
        tokio::select! {
            _ = token.cancelled() => {}
            closed = async { paused.wait_for(|p| *p).await.is_err() } => {
                if closed {
                    token.cancelled().await;
                }
            }
        }
    }
}

impl Default for RunSignals {
    fn default() -> Self {
        Self::new()
    }
}
