//! HTTP gateway for toolbridge.
//!
//! Exposes an OpenAI-compatible chat-completions endpoint backed by the
//! agent loop, plus a health check.
//!
//! - `POST /chat/completions` and `POST /v1/chat/completions`
//! - `GET  /health`
//!
//! Built on Axum. Each request runs its own agent loop task; nothing is
//! shared between requests except the driver and tool backend handles.

pub mod assembler;
pub mod openai;

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event as SseEvent, Sse},
    },
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use toolbridge_agent::{AgentLoop, LoopSettings};
use toolbridge_config::AppConfig;
use toolbridge_core::message::{Conversation, Message};
use toolbridge_core::provider::TurnDriver;
use toolbridge_core::tool::ToolBackend;
use tracing::{debug, info, warn};

pub use assembler::ResponseAssembler;
use openai::{ChatCompletionRequest, ChatMessage, ErrorResponse};

/// Message returned when a request carries no user question.
pub const MISSING_USER_MESSAGE: &str = "A user message is required to ask a question.";

/// Shared application state for the gateway.
pub struct GatewayState {
    pub driver: Arc<dyn TurnDriver>,
    pub tools: Arc<dyn ToolBackend>,
    /// Deployment defaults; `simulate` may be overridden per request
    pub settings: LoopSettings,
    pub include_tool_logs: bool,
    pub event_buffer: usize,
}

type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(config: &AppConfig, driver: Arc<dyn TurnDriver>, tools: Arc<dyn ToolBackend>) -> Self {
        Self {
            driver,
            tools,
            settings: LoopSettings::from_config(&config.agent),
            include_tool_logs: config.agent.include_tool_logs,
            event_buffer: config.gateway.event_buffer,
        }
    }

    /// Build the driver and tool backend described by `config`.
    ///
    /// The system prompt file is resolved against `base_dir`.
    pub fn from_config(config: &AppConfig, base_dir: &Path) -> toolbridge_core::Result<Self> {
        let driver = toolbridge_providers::build_from_config(config, config.system_prompt(base_dir))?;
        let tools = toolbridge_tools::build_from_config(config);
        Ok(Self::new(config, driver, tools))
    }
}

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server on the configured address.
pub async fn serve(config: &AppConfig, state: SharedState) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    info!(
        addr = %addr,
        model = state.driver.model(),
        tools = state.tools.endpoint(),
        simulate = state.settings.simulate,
        "Gateway starting"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /chat/completions`: run the agent loop for one conversation.
///
/// Streaming responses are SSE `chat.completion.chunk` frames ending in
/// `[DONE]`. Loop failures are reported inside the response body, never
/// as an HTTP error, since a stream may already be under way.
async fn chat_completions_handler(
    State(state): State<SharedState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    info!(
        messages = request.messages.len(),
        stream = request.stream,
        simulate = ?request.simulate,
        "Chat completion request"
    );

    if !has_user_question(&request.messages) {
        warn!("Rejected chat completion without a user message");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::invalid_request(MISSING_USER_MESSAGE)),
        )
            .into_response();
    }

    let conversation = to_conversation(&request.messages);
    let settings = state.settings.with_simulate(request.simulate);
    let agent = AgentLoop::new(Arc::clone(&state.driver), Arc::clone(&state.tools), settings);
    let mut events = agent.spawn(conversation, state.event_buffer);
    let mut assembler = ResponseAssembler::new(state.driver.model(), state.include_tool_logs);

    if !request.stream {
        let chunks = assembler.drain(&mut events).await;
        let prompt = request.messages.iter().map(ChatMessage::text).collect();
        let completion = assembler.completion(&chunks, prompt);
        debug!(id = %completion.id, "Chat completion ready");
        return Json(completion).into_response();
    }

    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(state.event_buffer.max(1));
    tokio::spawn(async move {
        // Dropping `events` on early return cancels the loop after its current step.
        while let Some(event) = events.recv().await {
            for chunk in assembler.translate(event) {
                if !send_chunk(&tx, &chunk).await {
                    debug!(id = assembler.id(), "Client disconnected mid-stream");
                    return;
                }
            }
        }
        for chunk in assembler.finish() {
            if !send_chunk(&tx, &chunk).await {
                return;
            }
        }
        let _ = tx.send(Ok(SseEvent::default().data("[DONE]"))).await;
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

async fn send_chunk(
    tx: &mpsc::Sender<Result<SseEvent, Infallible>>,
    chunk: &openai::ChatCompletionChunk,
) -> bool {
    let data = match serde_json::to_string(chunk) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "Failed to encode chunk");
            return true;
        }
    };
    tx.send(Ok(SseEvent::default().data(data))).await.is_ok()
}

/// Whether the most recent user message asks something.
fn has_user_question(messages: &[ChatMessage]) -> bool {
    messages
        .iter()
        .rev()
        .find(|m| m.role.eq_ignore_ascii_case("user"))
        .is_some_and(|m| !m.text().trim().is_empty())
}

/// Seed a conversation from client messages.
///
/// `system`/`developer` messages become instructions; roles the loop
/// cannot replay are dropped.
fn to_conversation(messages: &[ChatMessage]) -> Conversation {
    let mut conversation = Conversation::new();
    for message in messages {
        let text = message.text();
        match message.role.to_ascii_lowercase().as_str() {
            "user" => conversation.push(Message::user(text)),
            "assistant" => {
                if !text.is_empty() {
                    conversation.push(Message::assistant(text));
                }
            }
            "system" | "developer" => {
                if !text.trim().is_empty() {
                    conversation.instructions.push(text);
                }
            }
            other => warn!(role = %other, "Ignoring client message with unsupported role"),
        }
    }
    conversation
}
