//! `toolbridge ask`: One question through the agent loop, locally.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, bail};
use toolbridge_agent::AgentLoop;
use toolbridge_core::message::{Conversation, Message};
use toolbridge_gateway::{GatewayState, ResponseAssembler};

pub async fn run(
    config_path: Option<&Path>,
    message: &str,
    stream: bool,
    simulate: bool,
) -> anyhow::Result<()> {
    if message.trim().is_empty() {
        bail!("{}", toolbridge_gateway::MISSING_USER_MESSAGE);
    }

    let config = super::load_config(config_path)?;
    let base_dir = std::env::current_dir().context("Cannot read the working directory")?;
    let state = GatewayState::from_config(&config, &base_dir)
        .context("Failed to configure the turn driver")?;

    let mut conversation = Conversation::new();
    conversation.push(Message::user(message));

    let settings = state.settings.with_simulate(simulate.then_some(true));
    let agent = AgentLoop::new(state.driver.clone(), state.tools.clone(), settings);
    let mut events = agent.spawn(conversation, state.event_buffer);
    let mut assembler = ResponseAssembler::new(state.driver.model(), state.include_tool_logs);

    let mut finish_reason = None;
    if stream {
        let mut stdout = std::io::stdout().lock();
        loop {
            let chunks = match events.recv().await {
                Some(event) => assembler.translate(event),
                None => assembler.finish(),
            };
            for choice in chunks.iter().flat_map(|c| &c.choices) {
                if let Some(content) = &choice.delta.content {
                    write!(stdout, "{content}")?;
                    stdout.flush()?;
                }
                if let Some(reason) = &choice.finish_reason {
                    finish_reason = Some(reason.clone());
                }
            }
            if assembler.is_finished() {
                break;
            }
        }
        writeln!(stdout)?;
    } else {
        let chunks = assembler.drain(&mut events).await;
        let completion = assembler.completion(&chunks, vec![message.to_string()]);
        if let Some(choice) = completion.choices.into_iter().next() {
            println!("{}", choice.message.content);
            finish_reason = Some(choice.finish_reason);
        }
    }

    if finish_reason.as_deref() == Some("error") {
        bail!("The agent did not complete the request");
    }
    Ok(())
}
