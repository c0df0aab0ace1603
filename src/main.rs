//! Relay 命令行入口
//!
//! `relay [config.toml]`：逐行读取 stdin，以身份 "cli" 调用 chat 并打印回复；Ctrl-C 取消进行中的请求。
//! 以 `/` 开头的行是本地命令：/health、/simulate on|off、/quit。

use std::path::PathBuf;

use anyhow::Context;
use relay::config::load_config;
use relay::{ChatOptions, ChatOrchestrator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const CLI_IDENTITY: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay::observability::init()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let orchestrator = ChatOrchestrator::from_config(&cfg).context("Failed to build orchestrator")?;

    eprintln!(
        "relay ready: providers [{}], workspace {}",
        orchestrator.registry().names().join(", "),
        orchestrator.sandbox().root().display()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/health" => {
                let available: std::collections::BTreeMap<String, bool> =
                    orchestrator.registry().availability().await.into_iter().collect();
                let report = serde_json::json!({
                    "providers": orchestrator.health(),
                    "available": available,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                continue;
            }
            "/simulate on" => {
                orchestrator.sandbox().set_simulate(true);
                continue;
            }
            "/simulate off" => {
                orchestrator.sandbox().set_simulate(false);
                continue;
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };
        let options = ChatOptions::default().with_cancel_token(cancel);
        let outcome = orchestrator.chat_outcome(CLI_IDENTITY, line, options).await;
        watcher.abort();

        match (&outcome.response_text, &outcome.error) {
            (Some(text), _) => {
                println!("{text}");
                if let (Some(provider), Some(steps)) = (&outcome.provider_used, outcome.steps_taken) {
                    eprintln!("[{provider}, {steps} tool steps]");
                }
            }
            (None, Some(error)) => eprintln!("error: {error}"),
            (None, None) => {}
        }
    }
    Ok(())
}
