//! Orca - 多代理任务编排
//!
//! 入口：初始化日志、加载配置、组建团队（LLM 助手 + 终端用户），提交任务并打印对外消息。
//! Ctrl-C 暂停运行并保存状态；`--resume` 从保存的状态继续。
//!
//! 用法：`orca [--config <path>] [--resume] <task...>`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use orca::agents::{ConsoleUser, LlmWorker};
use orca::config::{load_config, AppConfig};
use orca::llm::create_llm_from_config;
use orca::memory::StateStore;
use orca::orchestrator::{OrchestratorState, USER_AGENT};
use orca::team::{TeamBuilder, TeamEvent};

const DEFAULT_STATE_PATH: &str = "workspace/orchestrator_state.json";

/// 多代理任务编排器
#[derive(Parser, Debug)]
#[command(name = "orca")]
#[command(version)]
struct Args {
    /// 额外的配置文件（叠加在 config/default.toml 之上）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 从上次 Ctrl-C 保存的状态继续
    #[arg(long)]
    resume: bool,

    /// 任务描述
    #[arg(required_unless_present = "resume")]
    task: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orca::observability::init();

    let args = Args::parse();
    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let store = StateStore::new(
        cfg.app
            .state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
    );

    let llm = create_llm_from_config(&cfg);
    let team = TeamBuilder::new(llm.clone(), cfg.orchestrator.clone())
        .with_agent(Arc::new(LlmWorker::new(
            "assistant",
            "a general purpose assistant that can reason, write and summarize",
            llm.clone(),
        )))
        .with_user_agent(Arc::new(ConsoleUser::new(USER_AGENT)))
        .build()
        .context("Failed to assemble team")?;

    let mut events = team.subscribe();
    let handle = team.handle().clone();

    if args.resume {
        let state: OrchestratorState = store
            .load()?
            .with_context(|| format!("no saved state at {}", store.path().display()))?;
        tracing::info!(task = %state.task, "Resuming saved run");
        handle.load_state(state)?;
        handle.resume()?;
    } else {
        handle.start(args.task.join(" "))?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TeamEvent::Message(m)) if !m.is_internal() => {
                    println!("[{}] {}", m.source, m.content);
                }
                Some(TeamEvent::Message(_)) => {}
                Some(TeamEvent::Terminated(stop)) => {
                    if stop.error {
                        tracing::error!(reason = %stop.reason, "Run failed");
                    } else {
                        tracing::info!(reason = %stop.reason, "Run finished");
                    }
                    store.clear()?;
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, pausing and saving state");
                handle.pause()?;
                let state = handle.save_state();
                if state.task.is_empty() {
                    tracing::warn!("No run in progress, nothing to save");
                } else {
                    store.save(&state)?;
                    println!("State saved to {}; continue with --resume", store.path().display());
                }
                // 释放可能正在等待终端输入的用户回合
                let _ = handle.cancel();
                break;
            }
        }
    }

    let (prompt, completion, total) = llm.token_usage();
    tracing::info!(prompt, completion, total, "Token usage");
    let _ = handle.shutdown();
    Ok(())
}
