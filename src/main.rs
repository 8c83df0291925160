//! chat-planner 命令行入口
//!
//! 读取标准输入逐行对话：每行作为一条用户消息，连同本地累积的历史提交一轮。
//! `/reset` 清空会话，`/quit` 退出。

use std::path::PathBuf;

use anyhow::Context;
use chat_planner::config::load_config;
use chat_planner::core::{ServiceBuilder, TurnRequest};
use chat_planner::memory::Message;
use chat_planner::observability;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const SESSION_ID: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let service = ServiceBuilder::new(cfg)
        .build()
        .await
        .context("Failed to build chat service")?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<Message> = Vec::new();

    stdout
        .write_all(b"chat-planner ready. Type a message, /reset or /quit.\n> ")
        .await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => {}
            "/quit" | "/exit" => break,
            "/reset" => {
                history.clear();
                service.reset_session(SESSION_ID).await;
                stdout.write_all(b"Session cleared.\n").await?;
            }
            _ => {
                history.push(Message::user(input));
                match service
                    .handle_turn(TurnRequest::new(SESSION_ID, history.clone()))
                    .await
                {
                    Ok(outcome) => {
                        let reply = format!("{}\n", outcome.response.content);
                        history.push(outcome.response);
                        stdout.write_all(reply.as_bytes()).await?;
                    }
                    Err(e) => {
                        history.pop();
                        tracing::warn!("turn failed: {}", e);
                        stdout.write_all(format!("Error: {}\n", e).as_bytes()).await?;
                    }
                }
            }
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }

    Ok(())
}
