//! signup-pilot 控制台入口
//!
//! 每行输入一条消息；`/action {"action": "...", "payload": ...}` 发送按钮动作，`/quit` 退出。
//! 每轮的响应以 JSON 输出到 stdout，日志输出到 stderr。

use anyhow::Context;
use signup_pilot::config::load_config;
use signup_pilot::core::EngineBuilder;
use signup_pilot::{observability, FlowAction, Turn};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let user = config
        .app
        .default_user
        .clone()
        .unwrap_or_else(|| "console-user".to_string());
    let engine = EngineBuilder::new(config)
        .build()
        .await
        .context("Failed to build engine")?;

    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(session = %session_id, user = %user, "console session started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }

        let turn = match line.strip_prefix("/action") {
            Some(raw) => match serde_json::from_str::<FlowAction>(raw.trim()) {
                Ok(action) => Turn::action(session_id.as_str(), Some(&user), action),
                Err(e) => {
                    eprintln!("invalid action: {e}");
                    continue;
                }
            },
            None => Turn::message(session_id.as_str(), Some(&user), line),
        };

        let response = engine.machine.handle(turn).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    Ok(())
}
