//! `slowhands agent`: run one task from the terminal.
//!
//! Steps are printed to stderr as they happen; the final answer goes to
//! stdout so it can be piped.

use slowhands_config::AppConfig;
use slowhands_core::message::{Conversation, Message};
use slowhands_core::step::{AgentStep, Phase};
use slowhands_core::tool::ToolRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub async fn run(
    message: String,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let agent = slowhands_gateway::build_agent(&config, Arc::new(ToolRegistry::new())).map_err(|e| {
        eprintln!();
        eprintln!("  Set SLOWHANDS_API_KEY, OPENAI_API_KEY or OPENROUTER_API_KEY,");
        eprintln!("  or add api_key to {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        format!("Backend not configured: {e}")
    })?;

    let mut conversation = Conversation::new();
    conversation.push(Message::user(message));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let run = async {
        let tx = tx;
        agent.run(&mut conversation, &tx, &cancel).await
    };
    let print = async {
        while let Some(step) = rx.recv().await {
            if !step.phase.is_terminal() {
                eprintln!("{}", render_step(&step));
            }
        }
    };
    let (terminal, ()) = tokio::join!(run, print);

    match terminal.phase {
        Phase::Respond => {
            println!("{}", terminal.content);
            Ok(())
        }
        Phase::Stopped => {
            eprintln!("  [stopped] {}", terminal.content);
            Ok(())
        }
        _ => Err(terminal.content.into()),
    }
}

fn render_step(step: &AgentStep) -> String {
    let mut line = format!("  [{} {}] {}", step.step_number, step.phase, step.content);
    if let Some(name) = step.tool_name() {
        let outcome = if step.tool_success() == Some(true) { "ok" } else { "failed" };
        line.push_str(&format!(" ({name}: {outcome})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use slowhands_core::tool::{ToolCall, ToolResult};

    #[test]
    fn renders_plain_step() {
        let step = AgentStep::new(2, Phase::Think, "Planning");
        assert_eq!(render_step(&step), "  [2 think] Planning");
    }

    #[test]
    fn renders_tool_outcome() {
        let call = ToolCall {
            id: "c1".into(),
            name: "file_read".into(),
            arguments: serde_json::json!({"path": "a.py"}),
        };
        let result = ToolResult::fail("missing");
        let step = AgentStep::new(3, Phase::Act, "Reading").with_tool(call, result);
        assert_eq!(render_step(&step), "  [3 act] Reading (file_read: failed)");
    }
}
