//! End-to-end tests for the toolbridge gateway.
//!
//! Requests go through the HTTP router, the agent loop and the response
//! assembler. Most tests script the model turns; the last group talks to
//! a local stand-in for the Anthropic Messages API through the real driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::post;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use toolbridge_agent::testing::{MockBackend, ScriptedDriver, text_turn, tool_call_turn};
use toolbridge_config::AppConfig;
use toolbridge_core::event::{StopReason, TurnEvent};
use toolbridge_core::provider::TurnDriver;
use toolbridge_core::tool::{ToolDescriptor, ToolOutput};
use toolbridge_gateway::{GatewayState, build_router};
use tower::ServiceExt;

// ── Helpers ──────────────────────────────────────────────────────────────

fn config() -> AppConfig {
    AppConfig::default()
}

fn lookup_backend() -> MockBackend {
    MockBackend::new(vec![ToolDescriptor::new("lookup", "Look things up")])
}

fn app(config: &AppConfig, driver: Arc<dyn TurnDriver>, backend: Arc<MockBackend>) -> Router {
    build_router(Arc::new(GatewayState::new(config, driver, backend)))
}

fn chat(text: &str, stream: bool) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "whatever",
                "messages": [{"role": "user", "content": text}],
                "stream": stream
            })
            .to_string(),
        ))
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn aggregate(app: Router, text: &str) -> Value {
    let response = app.oneshot(chat(text, false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    serde_json::from_str(&body_string(response).await).unwrap()
}

async fn stream_payloads(app: Router, text: &str) -> Vec<String> {
    let response = app.oneshot(chat(text, true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_string(response)
        .await
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}

fn content(payloads: &[String]) -> String {
    payloads
        .iter()
        .filter(|p| p.as_str() != "[DONE]")
        .filter_map(|p| {
            let v: Value = serde_json::from_str(p).unwrap();
            v["choices"][0]["delta"]["content"].as_str().map(str::to_string)
        })
        .collect()
}

fn answer(json: &Value) -> &str {
    json["choices"][0]["message"]["content"].as_str().unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_plain_answer_without_tools() {
    let driver = Arc::new(ScriptedDriver::new(vec![text_turn("hello back")]));
    let backend = Arc::new(lookup_backend());
    let json = aggregate(app(&config(), driver.clone(), backend.clone()), "hello").await;

    assert_eq!(answer(&json), "hello back");
    assert!(json["choices"][0]["message"].get("tool_calls").is_none());
    assert_eq!(driver.call_count(), 1);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn e2e_tool_round_trip_answer() {
    let mut config = config();
    config.agent.include_tool_logs = false;

    let driver = Arc::new(ScriptedDriver::new(vec![
        tool_call_turn("c1", "lookup", r#"{"q":"x"}"#),
        text_turn("The answer is 42"),
    ]));
    let backend = Arc::new(lookup_backend().with_output("lookup", ToolOutput::success("42")));
    let json = aggregate(app(&config, driver.clone(), backend.clone()), "what is x?").await;

    assert_eq!(answer(&json), "The answer is 42");
    assert_eq!(backend.calls(), vec![("lookup".to_string(), json!({"q": "x"}))]);
    assert_eq!(json["choices"][0]["message"]["tool_calls"][0]["id"], "c1");

    // The result was in the conversation before the second turn.
    let second = &driver.conversations()[1];
    let result = second
        .messages
        .iter()
        .flat_map(|m| m.tool_results_iter())
        .find(|r| r.call_id == "c1")
        .unwrap();
    assert_eq!(result.content, "42");
}

#[tokio::test]
async fn e2e_tool_round_trip_with_tool_logs() {
    let driver = Arc::new(ScriptedDriver::new(vec![
        tool_call_turn("c1", "lookup", r#"{"q":"x"}"#),
        text_turn("The answer is 42"),
    ]));
    let backend = Arc::new(lookup_backend().with_output("lookup", ToolOutput::success("42")));
    let json = aggregate(app(&config(), driver, backend), "what is x?").await;

    let text = answer(&json);
    assert!(text.starts_with("\n\nCalling `lookup` with args:\n```json\n{\"q\":\"x\"}\n```"));
    assert!(text.contains("Result from `lookup`:\n```json\n42\n```\n"));
    assert!(text.ends_with("The answer is 42"));
}

#[tokio::test]
async fn e2e_tool_error_is_fed_back_to_the_model() {
    let driver = Arc::new(ScriptedDriver::new(vec![
        tool_call_turn("c2", "lookup", r#"{"q":"boom"}"#),
        text_turn("The lookup failed."),
    ]));
    let backend =
        Arc::new(lookup_backend().with_output("lookup", ToolOutput::failure("index offline")));
    let json = aggregate(app(&config(), driver.clone(), backend), "try").await;

    assert!(answer(&json).ends_with("The lookup failed."));
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(driver.call_count(), 2);

    let second = &driver.conversations()[1];
    let result = second
        .messages
        .iter()
        .flat_map(|m| m.tool_results_iter())
        .find(|r| r.call_id == "c2")
        .unwrap();
    assert!(result.is_error);
    assert_eq!(result.content, "index offline");
}

#[tokio::test]
async fn e2e_turn_budget_stops_the_loop() {
    let mut config = config();
    config.agent.turn_budget = 3;

    let driver = Arc::new(ScriptedDriver::repeating(tool_call_turn(
        "c1",
        "lookup",
        r#"{"q":"more"}"#,
    )));
    let backend = Arc::new(lookup_backend());
    let payloads = stream_payloads(app(&config, driver.clone(), backend.clone()), "go").await;

    assert_eq!(driver.call_count(), 3);
    assert_eq!(backend.calls().len(), 3);
    assert_eq!(payloads.iter().filter(|p| *p == "[DONE]").count(), 1);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    assert!(content(&payloads).contains("limit of 3 tool-use turns"));

    let last: Value = serde_json::from_str(&payloads[payloads.len() - 2]).unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn e2e_malformed_arguments_skip_the_registry() {
    let driver = Arc::new(ScriptedDriver::new(vec![
        tool_call_turn("c1", "lookup", "{\"q\": "),
        text_turn("Let me try again later."),
    ]));
    let backend = Arc::new(lookup_backend());
    let json = aggregate(app(&config(), driver.clone(), backend.clone()), "go").await;

    assert!(backend.calls().is_empty());
    assert!(answer(&json).ends_with("Let me try again later."));
    let second = &driver.conversations()[1];
    assert!(second.unanswered_calls().is_empty());
}

#[tokio::test]
async fn e2e_registry_down_degrades_to_no_tools() {
    let driver = Arc::new(ScriptedDriver::new(vec![text_turn("From memory: 42")]));
    let backend = Arc::new(MockBackend::unavailable("connection refused"));
    let json = aggregate(app(&config(), driver.clone(), backend), "what is x?").await;

    assert_eq!(answer(&json), "From memory: 42");
    assert_eq!(driver.offered_tools(), vec![Vec::<String>::new()]);
}

#[tokio::test]
async fn e2e_stream_and_aggregate_agree_without_tools() {
    let make = || {
        app(
            &config(),
            Arc::new(ScriptedDriver::new(vec![text_turn("Same text, both ways.")])),
            Arc::new(lookup_backend()),
        )
    };
    let streamed = content(&stream_payloads(make(), "hi").await);
    let json = aggregate(make(), "hi").await;
    assert_eq!(answer(&json), streamed);
}

fn reasoning(payloads: &[String]) -> String {
    payloads
        .iter()
        .filter(|p| p.as_str() != "[DONE]")
        .filter_map(|p| {
            let v: Value = serde_json::from_str(p).unwrap();
            v["choices"][0]["delta"]["reasoning_content"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}

fn text_delta(text: &str) -> TurnEvent {
    TurnEvent::TextDelta {
        text: text.to_string(),
    }
}

#[tokio::test]
async fn e2e_stream_and_aggregate_agree_across_turns_with_thinking() {
    let first = vec![
        TurnEvent::ThinkingDelta {
            text: "Need to ".into(),
        },
        TurnEvent::ThinkingDelta {
            text: "look it up.".into(),
        },
        TurnEvent::ThinkingEnd {
            signature: Some("sig".into()),
        },
        text_delta("Checking "),
        text_delta("the index."),
        TurnEvent::ToolCallStart {
            call_id: "c1".into(),
            tool_name: "lookup".into(),
        },
        TurnEvent::ToolCallArgsDelta {
            call_id: "c1".into(),
            partial_json: r#"{"q":"x"}"#.into(),
        },
        TurnEvent::ToolCallEnd {
            call_id: "c1".into(),
        },
        TurnEvent::end(StopReason::ToolUse),
    ];
    let second = vec![
        text_delta("Done: "),
        text_delta("42."),
        TurnEvent::end(StopReason::EndTurn),
    ];
    let make = || {
        app(
            &config(),
            Arc::new(ScriptedDriver::new(vec![first.clone(), second.clone()])),
            Arc::new(lookup_backend().with_output("lookup", ToolOutput::success("42"))),
        )
    };

    let payloads = stream_payloads(make(), "what is x?").await;
    let streamed = content(&payloads);
    let json = aggregate(make(), "what is x?").await;

    assert_eq!(answer(&json), streamed);
    assert!(streamed.starts_with("**Thoughts:**\n"));
    assert!(streamed.contains("Need to look it up."));
    assert!(streamed.contains("Checking the index."));
    assert!(streamed.ends_with("Done: 42."));
    assert_eq!(reasoning(&payloads), "Need to look it up.");
    assert_eq!(
        json["choices"][0]["message"]["reasoning_content"],
        "Need to look it up."
    );
}

#[tokio::test]
async fn e2e_simulation_from_config() {
    let mut config = config();
    config.agent.simulate = true;
    let driver = Arc::new(ScriptedDriver::new(vec![]));
    let json = aggregate(app(&config, driver.clone(), Arc::new(lookup_backend())), "hi").await;

    assert_eq!(answer(&json), toolbridge_agent::SIMULATED_RESPONSE);
    assert_eq!(driver.call_count(), 0);
}

// ── Real driver against a local Messages API ─────────────────────────────

fn sse_body(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
        .collect()
}

fn tool_use_turn() -> String {
    sse_body(&[
        json!({"type": "message_start", "message": {}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "lookup", "input": {}}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "\"x\"}"}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
        json!({"type": "message_stop"}),
    ])
}

fn answer_turn(text: &str) -> String {
    sse_body(&[
        json!({"type": "message_start", "message": {}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
        json!({"type": "message_stop"}),
    ])
}

/// Serve scripted SSE bodies in order; returns the base URL, the request
/// counter and the captured request bodies.
async fn messages_api(turns: Vec<String>) -> (String, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<Value>>>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(std::sync::Mutex::new(Vec::new()));
    let turns = Arc::new(turns);

    let router = {
        let counter = counter.clone();
        let bodies = bodies.clone();
        Router::new().route(
            "/v1/messages",
            post(move |body: axum::Json<Value>| {
                let counter = counter.clone();
                let bodies = bodies.clone();
                let turns = turns.clone();
                async move {
                    bodies.lock().unwrap().push(body.0);
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let sse = turns.get(n).cloned().unwrap_or_else(|| answer_turn("extra"));
                    ([("content-type", "text/event-stream")], sse)
                }
            }),
        )
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), counter, bodies)
}

#[tokio::test]
async fn e2e_anthropic_driver_tool_round_trip() {
    let (base_url, counter, bodies) =
        messages_api(vec![tool_use_turn(), answer_turn("The answer is 42")]).await;

    let mut config = config();
    config.provider.api_key = Some("sk-ant-test".into());
    config.provider.base_url = base_url;
    config.provider.model = "anthropic:claude-sonnet-4-20250514".into();
    config.agent.include_tool_logs = false;

    let driver = toolbridge_providers::build_from_config(&config, Some("Be terse.".into())).unwrap();
    let backend = Arc::new(lookup_backend().with_output("lookup", ToolOutput::success("42")));
    let json = aggregate(app(&config, driver, backend.clone()), "what is x?").await;

    assert_eq!(answer(&json), "The answer is 42");
    assert_eq!(json["model"], "claude-sonnet-4-20250514");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(backend.calls(), vec![("lookup".to_string(), json!({"q": "x"}))]);

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies[0]["system"], "Be terse.");
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["tools"][0]["name"], "lookup");

    // Second request replays the tool_use and answers it.
    let messages = bodies[1]["messages"].as_array().unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last["role"], "user");
    assert_eq!(last["content"][0]["type"], "tool_result");
    assert_eq!(last["content"][0]["tool_use_id"], "toolu_1");
    assert_eq!(last["content"][0]["content"], "42");
}

#[tokio::test]
async fn e2e_missing_api_key_streams_an_error_then_done() {
    let config = config();
    let driver = toolbridge_providers::build_from_config(&config, None).unwrap();
    let payloads = stream_payloads(app(&config, driver, Arc::new(lookup_backend())), "hello").await;

    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
    assert!(content(&payloads).contains("ANTHROPIC_API_KEY"));
    let last: Value = serde_json::from_str(&payloads[payloads.len() - 2]).unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "error");
}
