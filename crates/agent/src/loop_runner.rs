//! The agent loop: alternate model turns and tool phases until the model
//! answers, fails, or runs out of turn budget.

use std::sync::Arc;

use tokio::sync::mpsc;
use toolbridge_config::{AgentConfig, DiscoveryPolicy};
use toolbridge_core::error::{Error, RegistryError};
use toolbridge_core::event::{StopReason, TurnEvent};
use toolbridge_core::message::{Conversation, ToolResultBlock};
use toolbridge_core::provider::TurnDriver;
use toolbridge_core::tool::{ToolBackend, ToolRegistryClient};
use tracing::{debug, info, trace, warn};

use crate::session::{AgentSession, ClosedTurn};
use crate::stream_event::{AgentEvent, FinishReason};

/// Fixed reply used when simulation is on.
pub const SIMULATED_RESPONSE: &str = "Simulated response.";

/// Per-request loop settings, resolved once at request entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Maximum number of tool phases before the loop is cut short
    pub turn_budget: u32,
    pub discovery_policy: DiscoveryPolicy,
    pub simulate: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            turn_budget: 10,
            discovery_policy: DiscoveryPolicy::Degrade,
            simulate: false,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            turn_budget: config.turn_budget.max(1),
            discovery_policy: config.discovery_failure,
            simulate: config.simulate,
        }
    }

    /// Apply a per-request simulate override.
    pub fn with_simulate(mut self, simulate: Option<bool>) -> Self {
        if let Some(simulate) = simulate {
            self.simulate = simulate;
        }
        self
    }

    pub fn with_turn_budget(mut self, turn_budget: u32) -> Self {
        self.turn_budget = turn_budget.max(1);
        self
    }

    pub fn with_discovery_policy(mut self, policy: DiscoveryPolicy) -> Self {
        self.discovery_policy = policy;
        self
    }
}

/// Forwards events to the consumer and remembers when it has gone away.
struct EventSink<'a> {
    tx: &'a mpsc::Sender<AgentEvent>,
    closed: bool,
}

impl EventSink<'_> {
    async fn emit(&mut self, event: AgentEvent) {
        if self.closed {
            return;
        }
        trace!(event = event.event_type(), "Emitting agent event");
        if self.tx.send(event).await.is_err() {
            debug!("Event consumer went away");
            self.closed = true;
        }
    }

    async fn emit_all(&mut self, events: Vec<AgentEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }
}

/// How one tool phase ended.
enum PhaseOutcome {
    Continue,
    Stop(FinishReason, String),
    Cancelled,
}

/// The core agent loop that orchestrates model turns and tool execution.
pub struct AgentLoop {
    driver: Arc<dyn TurnDriver>,
    tools: Arc<dyn ToolBackend>,
    settings: LoopSettings,
}

impl AgentLoop {
    pub fn new(
        driver: Arc<dyn TurnDriver>,
        tools: Arc<dyn ToolBackend>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            driver,
            tools,
            settings,
        }
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run the loop to completion, in a background task.
    ///
    /// The receiver yields events as they happen and closes after
    /// `Finished`. Dropping it stops the loop after its current step.
    pub fn spawn(self, conversation: Conversation, buffer: usize) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(async move {
            self.run(conversation, &tx).await;
        });
        rx
    }

    /// Run the loop to completion on the current task.
    ///
    /// Every run sends exactly one `Finished` event last, unless the
    /// consumer has already gone away.
    pub async fn run(
        &self,
        conversation: Conversation,
        events: &mpsc::Sender<AgentEvent>,
    ) -> AgentSession {
        let mut session = AgentSession::new(conversation);
        let mut sink = EventSink {
            tx: events,
            closed: false,
        };

        if self.settings.simulate {
            info!("Simulation mode, skipping model and tools");
            sink.emit(AgentEvent::Text {
                text: SIMULATED_RESPONSE.to_string(),
            })
            .await;
            session.finish(FinishReason::Completed, None);
            sink.emit(AgentEvent::Finished {
                reason: FinishReason::Completed,
                notice: None,
                turns: 0,
            })
            .await;
            return session;
        }

        let mut registry = ToolRegistryClient::new(Arc::clone(&self.tools));
        if let Err(e) = registry.discover().await {
            match self.settings.discovery_policy {
                DiscoveryPolicy::Degrade => {
                    warn!(endpoint = self.tools.endpoint(), error = %e, "Tool discovery failed, continuing without tools");
                }
                DiscoveryPolicy::Abort => {
                    warn!(endpoint = self.tools.endpoint(), error = %e, "Tool discovery failed, aborting request");
                    let notice = e.to_string();
                    self.finish(
                        &mut session,
                        &mut sink,
                        FinishReason::RegistryUnavailable,
                        Some(notice),
                    )
                    .await;
                    return session;
                }
            }
        }
        session.offer_tools(registry.descriptors().iter().map(|t| t.name.as_str()));

        info!(
            provider = self.driver.name(),
            model = self.driver.model(),
            tools = registry.descriptors().len(),
            turn_budget = self.settings.turn_budget,
            "Agent loop starting"
        );

        loop {
            if sink.closed {
                self.cancel(&mut session);
                return session;
            }

            let turn = session.begin_turn();
            debug!(turn, "Requesting model turn");
            sink.emit(AgentEvent::TurnStarted { turn }).await;

            let mut stream = self
                .driver
                .run_turn(&session.conversation, registry.descriptors())
                .await;

            let mut ending = (StopReason::Error, None);
            while let Some(event) = stream.next().await {
                if let TurnEvent::TurnEnd { stop_reason, error } = event {
                    ending = (stop_reason, error);
                    break;
                }
                let forwarded = session.observe(event);
                sink.emit_all(forwarded).await;
            }

            let closed = session.close_turn();
            sink.emit_all(closed.events.clone()).await;

            let (stop_reason, error) = ending;
            debug!(turn, stop_reason = %stop_reason, calls = closed.ready.len() + closed.rejected.len(), "Model turn ended");

            match stop_reason {
                StopReason::EndTurn => {
                    self.finish(&mut session, &mut sink, FinishReason::Completed, None)
                        .await;
                    return session;
                }
                StopReason::ToolUse if !closed.has_calls() => {
                    debug!(turn, "tool_use turn without tool calls, treating as end_turn");
                    self.finish(&mut session, &mut sink, FinishReason::Completed, None)
                        .await;
                    return session;
                }
                StopReason::MaxTokens => {
                    let notice = "The response was cut short because the model reached its output token limit.".to_string();
                    self.finish(&mut session, &mut sink, FinishReason::MaxTokens, Some(notice))
                        .await;
                    return session;
                }
                StopReason::Error => {
                    let detail = error.unwrap_or_else(|| "unknown error".to_string());
                    warn!(turn, error = %detail, "Model turn failed");
                    let notice = format!("The model request failed: {detail}");
                    self.finish(&mut session, &mut sink, FinishReason::ProviderError, Some(notice))
                        .await;
                    return session;
                }
                StopReason::ToolUse => {}
            }

            match self
                .run_tool_phase(&mut session, &mut sink, &registry, closed)
                .await
            {
                PhaseOutcome::Continue => {}
                PhaseOutcome::Cancelled => {
                    self.cancel(&mut session);
                    return session;
                }
                PhaseOutcome::Stop(reason, notice) => {
                    self.finish(&mut session, &mut sink, reason, Some(notice))
                        .await;
                    return session;
                }
            }

            if session.tool_phases() >= self.settings.turn_budget {
                warn!(
                    turns = session.tool_phases(),
                    "Turn budget exhausted"
                );
                let notice = format!(
                    "Stopped after reaching the limit of {} tool-use turns before the model produced a final answer.",
                    self.settings.turn_budget
                );
                self.finish(
                    &mut session,
                    &mut sink,
                    FinishReason::BudgetExhausted,
                    Some(notice),
                )
                .await;
                return session;
            }
        }
    }

    /// Invoke every call of the closed turn, one at a time in completion
    /// order, then append one result per call.
    async fn run_tool_phase(
        &self,
        session: &mut AgentSession,
        sink: &mut EventSink<'_>,
        registry: &ToolRegistryClient,
        closed: ClosedTurn,
    ) -> PhaseOutcome {
        session.enter_tool_phase();
        let mut results = Vec::with_capacity(closed.ready.len() + closed.rejected.len());

        for call in closed.ready {
            if sink.closed {
                return PhaseOutcome::Cancelled;
            }

            debug!(call_id = %call.call_id, tool = %call.tool_name, "Invoking tool");
            match registry.invoke(&call).await {
                Ok(result) => {
                    if result.is_error {
                        debug!(call_id = %call.call_id, tool = %call.tool_name, "Tool reported an error");
                    }
                    sink.emit(AgentEvent::ToolResult {
                        call,
                        result: result.clone(),
                    })
                    .await;
                    results.push(result);
                }
                Err(RegistryError::UnknownTool(name)) => {
                    warn!(tool = %name, "Invoked a tool outside the discovered set");
                    let error = Error::Internal(format!(
                        "tool `{name}` is not in the discovered tool set."
                    ));
                    return PhaseOutcome::Stop(FinishReason::Fatal, error.to_string());
                }
                Err(e @ RegistryError::Unavailable(_)) => {
                    warn!(call_id = %call.call_id, tool = %call.tool_name, error = %e, "Tool invocation failed");
                    return PhaseOutcome::Stop(
                        FinishReason::Fatal,
                        format!("Tool `{}` could not be invoked: {e}", call.tool_name),
                    );
                }
            }
        }

        for (_, malformed) in closed.rejected {
            results.push(ToolResultBlock::error(
                &malformed.call_id,
                format!("Error: {}", malformed.reason),
            ));
        }

        let turns = session.record_results(results);
        debug!(turns, "Tool phase complete");
        PhaseOutcome::Continue
    }

    async fn finish(
        &self,
        session: &mut AgentSession,
        sink: &mut EventSink<'_>,
        reason: FinishReason,
        notice: Option<String>,
    ) {
        session.finish(reason, notice.as_deref());
        info!(
            reason = ?reason,
            turns = session.tool_phases(),
            model_turns = session.provider_turns(),
            "Agent loop finished"
        );
        sink.emit(AgentEvent::Finished {
            reason,
            notice,
            turns: session.tool_phases(),
        })
        .await;
    }

    fn cancel(&self, session: &mut AgentSession) {
        info!(turns = session.tool_phases(), "Client went away, stopping agent loop");
        session.finish(FinishReason::Cancelled, None);
    }
}
