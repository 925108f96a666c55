//! OpenAI-compatible chat HTTP server.
//!
//! Answers chat requests against one ingested collection, so existing
//! OpenAI chat clients can talk to a repository.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/chat/completions` | Retrieval-augmented chat completion (SSE or JSON) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Streaming
//!
//! With `"stream": true` (the default) the answer is sent as
//! `chat.completion.chunk` server-sent events, one character per event with a
//! configurable delay, followed by a chunk carrying `finish_reason: "stop"`
//! and a final `data: [DONE]`. A client that disconnects stops the stream.
//! With `"stream": false` a single `chat.completion` object is returned.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "messages list is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! # CORS
//!
//! Local front ends only: `http://localhost`, `http://localhost:3000`,
//! `http://127.0.0.1:3000`, `http://localhost:8000` and
//! `http://127.0.0.1:8000`, with credentials.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

use crate::chat::{engine_from_config, fragments, ChatEngine, CompletionOptions, Message};
use crate::config::Config;
use crate::error::ChatError;

/// Browser origins allowed to call the API.
pub const ALLOWED_ORIGINS: [&str; 5] = [
    "http://localhost",
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:8000",
    "http://127.0.0.1:8000",
];

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<ChatEngine>,
    /// Pause between streamed fragments.
    stream_delay: Duration,
}

impl AppState {
    pub fn new(engine: Arc<ChatEngine>, stream_delay: Duration) -> Self {
        Self {
            engine,
            stream_delay,
        }
    }
}

/// Build the router with CORS applied.
pub fn router(state: AppState) -> Router {
    let origins = ALLOWED_ORIGINS.into_iter().map(HeaderValue::from_static);
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the chat server for `collection`.
///
/// Binds to `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config, collection: &str) -> anyhow::Result<()> {
    let engine = engine_from_config(config, collection)?;
    let state = AppState::new(
        Arc::new(engine),
        Duration::from_millis(config.server.stream_delay_ms),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        "Chat server for collection '{}' listening on http://{}",
        collection,
        config.server.bind
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        if err.is_bad_request() {
            bad_request(err.to_string())
        } else {
            tracing::error!("Chat request failed: {}", err);
            internal(err.to_string())
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /v1/chat/completions ============

/// Request body, a subset of the OpenAI chat completions request.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: String,
    messages: Vec<Message>,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_temperature() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_stream() -> bool {
    true
}

#[derive(Serialize)]
struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Serialize)]
struct ChunkChoice {
    index: u32,
    delta: Delta,
    finish_reason: Option<&'static str>,
}

/// One `chat.completion.chunk` SSE payload.
#[derive(Serialize)]
struct CompletionChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChunkChoice>,
}

#[derive(Serialize)]
struct CompletionChoice {
    index: u32,
    message: Message,
    finish_reason: &'static str,
}

#[derive(Serialize)]
struct Completion {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<CompletionChoice>,
}

/// Identity shared by every chunk of one response.
#[derive(Clone)]
struct ResponseMeta {
    id: String,
    created: i64,
    model: String,
}

impl ResponseMeta {
    fn chunk(&self, delta: Delta, finish_reason: Option<&'static str>) -> CompletionChunk {
        CompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

fn json_event<T: Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::error!("Failed to serialize SSE payload: {}", e);
            Event::default().comment("serialization error")
        }
    }
}

async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let options = CompletionOptions {
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    };
    let answer = state.engine.answer(&request.messages, &options).await?;

    let meta = ResponseMeta {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        created: chrono::Utc::now().timestamp(),
        model: if request.model.is_empty() {
            state.engine.model_name().to_string()
        } else {
            request.model
        },
    };

    if !request.stream {
        let body = Completion {
            id: meta.id,
            object: "chat.completion",
            created: meta.created,
            model: meta.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: Message::assistant(answer),
                finish_reason: "stop",
            }],
        };
        return Ok(Json(body).into_response());
    }

    let content_meta = meta.clone();
    let content = fragments(answer, state.stream_delay).map(move |piece| {
        let delta = Delta {
            role: Some("assistant"),
            content: Some(piece),
        };
        Ok::<_, Infallible>(json_event(&content_meta.chunk(delta, None)))
    });

    let stop = json_event(&meta.chunk(
        Delta {
            role: None,
            content: None,
        },
        Some("stop"),
    ));
    let tail = stream::iter([
        Ok::<_, Infallible>(stop),
        Ok(Event::default().data("[DONE]")),
    ]);

    Ok(Sse::new(content.chain(tail)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;

    use crate::chat::ChatModel;
    use crate::models::ScoredChunk;
    use crate::retrieve::Retriever;

    struct StubRetriever {
        fail: bool,
    }

    #[async_trait]
    impl Retriever for StubRetriever {
        async fn retrieve(&self, _query: &str, _k: usize) -> Result<Vec<ScoredChunk>> {
            if self.fail {
                anyhow::bail!("qdrant unavailable");
            }
            Ok(vec![ScoredChunk {
                text: "def main(): pass".to_string(),
                source_path: "main.py".to_string(),
                score: 1.0,
            }])
        }
    }

    struct StubModel;

    #[async_trait]
    impl ChatModel for StubModel {
        async fn complete(
            &self,
            _messages: &[Message],
            _options: &CompletionOptions,
        ) -> Result<String> {
            Ok("It runs.".to_string())
        }
        fn model_name(&self) -> &str {
            "gpt-4o"
        }
    }

    async fn spawn(fail_retrieval: bool) -> String {
        let engine = ChatEngine::new(
            Arc::new(StubRetriever {
                fail: fail_retrieval,
            }),
            Arc::new(StubModel),
            10,
        );
        let app = router(AppState::new(Arc::new(engine), Duration::ZERO));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn sse_payloads(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_health() {
        let base = spawn(false).await;
        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_empty_messages_is_bad_request() {
        let base = spawn(false).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({"model": "gpt-4o", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
        assert_eq!(body["error"]["message"], "messages list is empty");
    }

    #[tokio::test]
    async fn test_missing_user_message_is_bad_request() {
        let base = spawn(false).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "system", "content": "be nice"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_streams_one_character_per_event() {
        let base = spawn(false).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "what does main do?"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = resp.text().await.unwrap();
        let payloads = sse_payloads(&body);
        assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

        let chunks: Vec<serde_json::Value> = payloads[..payloads.len() - 1]
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect();
        assert_eq!(chunks.len(), "It runs.".chars().count() + 1);

        let mut text = String::new();
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk["object"], "chat.completion.chunk");
            assert_eq!(chunk["model"], "gpt-4o");
            assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
            assert!(chunk["choices"][0]["finish_reason"].is_null());
            text.push_str(chunk["choices"][0]["delta"]["content"].as_str().unwrap());
        }
        assert_eq!(text, "It runs.");

        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(chunks[0]["id"], last["id"]);
    }

    #[tokio::test]
    async fn test_non_streaming_completion() {
        let base = spawn(false).await;
        let body: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({
                "model": "my-model",
                "stream": false,
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "my-model");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "It runs.");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_backend_failure_is_internal_error() {
        let base = spawn(true).await;
        let resp = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", base))
            .json(&serde_json::json!({
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "internal");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("qdrant unavailable"));
    }

    #[tokio::test]
    async fn test_cors_allows_local_front_ends_only() {
        let base = spawn(false).await;
        let client = reqwest::Client::new();

        let allowed = client
            .get(format!("{}/health", base))
            .header("Origin", "http://localhost:3000")
            .send()
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );
        assert_eq!(allowed.headers()["access-control-allow-credentials"], "true");

        let denied = client
            .get(format!("{}/health", base))
            .header("Origin", "http://evil.example")
            .send()
            .await
            .unwrap();
        assert!(denied
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }
}
