//! HTTP routes and SSE framing.
//!
//! The boundary validates input, builds the bounded event channel, frames
//! `data: <json>\n\n` records, and delegates to the engine. Uncaught errors
//! map to an SSE `final` frame; the stream always ends.

use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use isocode_agent::{store, AgentRuntime, TurnRequest};
use isocode_core::{AgentEvent, ContextAttachment, Decision, Error, Mode, RuntimeConfig};
use isocode_llm::{CallOptions, ChatMessage, HttpProvider, LlmProvider};
use isocode_tools::{create_default_registry, FileIndexCache, ToolServerPool};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Interactive runs get a cap high enough that they rarely hit it; the cap
/// is still a hard upper bound.
const INTERACTIVE_MAX_STEPS: u64 = 500;
/// Bounded event channel: a slow client blocks the engine, which is the
/// back-pressure mechanism.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct AppState {
    pub runtime: AgentRuntime,
    pub provider: Arc<dyn LlmProvider>,
    pub server_pool: Arc<ToolServerPool>,
    pub index_cache: Arc<FileIndexCache>,
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub config_path: PathBuf,
    pub workspace_root: PathBuf,
}

/// Wire the provider, tool registry, and engine together from one config.
pub async fn build_state(
    config: RuntimeConfig,
    config_path: PathBuf,
    workspace_root: PathBuf,
) -> Arc<AppState> {
    let mut config = config;
    // Workspace-local tool servers extend whatever the user config carries.
    match load_workspace_tool_servers(&workspace_root) {
        Ok(servers) => {
            for server in servers {
                if !config.tool_servers.iter().any(|s| s.name == server.name) {
                    config.tool_servers.push(server);
                }
            }
        }
        Err(e) => warn!("{} - fix .isocode/mcp-servers.json and restart", e),
    }

    let mut provider = HttpProvider::new(config.provider.clone(), config.api_base.clone());
    if let Some(ref key) = config.api_key {
        provider = provider.with_api_key(key.clone());
    }
    let provider: Arc<dyn LlmProvider> = Arc::new(provider);

    let index_cache = Arc::new(FileIndexCache::new());
    let server_pool = Arc::new(ToolServerPool::new());
    server_pool.configure(&config.tool_servers).await;

    let registry = create_default_registry(
        provider.clone(),
        config.vision_model.clone(),
        index_cache.clone(),
        server_pool.clone(),
    );

    let config = Arc::new(RwLock::new(config));
    let runtime = AgentRuntime::new(
        provider.clone(),
        Arc::new(registry),
        index_cache.clone(),
        config.clone(),
    );

    Arc::new(AppState {
        runtime,
        provider,
        server_pool,
        index_cache,
        config,
        config_path,
        workspace_root,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/models", get(models_handler))
        .route("/config", post(config_handler))
        .route("/mcp-status", get(mcp_status_handler))
        .route("/chat", post(chat_handler))
        .route("/stop-agent", post(stop_handler))
        .route("/clear-session", post(clear_handler))
        .route("/compact", post(compact_handler))
        .route("/switch-model", post(switch_model_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/:id", get(load_session_handler))
        .route("/sessions/:id", delete(delete_session_handler))
        .route("/codebase", get(codebase_handler))
        .route("/codebase/reindex", post(reindex_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let port = state.config.read().await.port;
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;

    info!("isocode gateway starting");
    info!("  Listening on: http://{}", addr);
    info!("  Workspace:    {}", state.workspace_root.display());
    info!("  Provider:     {}", state.provider.name());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Plain JSON handlers
// ---------------------------------------------------------------------------

async fn index_handler() -> impl IntoResponse {
    Html(
        "<!doctype html><html><head><title>isocode</title></head><body>\
         <h1>isocode</h1><p>Local agent runtime is running. The editor \
         extension talks to <code>/chat</code>; see <code>/health</code> and \
         <code>/models</code> for backend status.</p></body></html>",
    )
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::to_value(state.provider.health().await).unwrap_or_default())
}

/// Always HTTP 200; backend failure is reported in the body.
async fn models_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let provider = state.provider.name().to_string();
    match state.provider.list_models().await {
        Ok(models) => Json(json!({ "models": models, "provider": provider })),
        Err(e) => Json(json!({ "models": [], "provider": provider, "error": e.to_string() })),
    }
}

async fn config_handler(
    State(state): State<Arc<AppState>>,
    Json(update): Json<Value>,
) -> impl IntoResponse {
    let mut config = state.config.write().await;
    config.merge_value(&update);
    if let Err(e) = config.save(&state.config_path) {
        warn!("failed to persist config: {}", e);
    }
    state.server_pool.configure(&config.tool_servers).await;
    Json(json!({ "ok": true }))
}

async fn mcp_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "servers": state.server_pool.status().await }))
}

#[derive(Deserialize)]
struct SessionBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    model: Option<String>,
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Response {
    match state.runtime.stop(&body.session_id) {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn clear_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> impl IntoResponse {
    let removed = state.runtime.clear(&body.session_id);
    Json(json!({ "ok": removed }))
}

async fn compact_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Response {
    match state
        .runtime
        .compact_session(&body.session_id, body.model)
        .await
    {
        Ok((before, after)) => Json(json!({ "before": before, "after": after })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn switch_model_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionBody>,
) -> Response {
    let Some(model) = body.model else {
        return error_response(&Error::user("missing required field: model"));
    };
    match state.runtime.switch_model(&body.session_id, &model).await {
        Ok(()) => Json(json!({ "ok": true, "model": model })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn sessions_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active: Vec<String> = state
        .runtime
        .sessions()
        .list()
        .into_iter()
        .map(|k| k.as_str().to_string())
        .collect();
    let saved = store::list_conversations(&state.workspace_root);
    Json(json!({ "active": active, "saved": saved }))
}

async fn load_session_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match store::load_conversation(&state.workspace_root, &id) {
        Some(record) => Json(serde_json::to_value(record).unwrap_or_default()).into_response(),
        None => error_response(&Error::SessionNotFound(id)),
    }
}

async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let deleted = store::delete_conversation(&state.workspace_root, &id);
    Json(json!({ "ok": deleted }))
}

async fn codebase_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let index = state.index_cache.get(&state.workspace_root);
    Json(json!({
        "totalFiles": index.total,
        "dirs": index.dirs.len(),
        "keyFiles": index.key_files.keys().collect::<Vec<_>>(),
        "map": index.project_map(),
    }))
}

async fn reindex_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.index_cache.invalidate(&state.workspace_root);
    Json(json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// /chat
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    message: Option<String>,
    #[serde(default)]
    auto_mode: bool,
    #[serde(default)]
    agent_plus: bool,
    model: Option<String>,
    session_id: Option<String>,
    decision: Option<Decision>,
    #[serde(default)]
    context: Vec<ContextAttachment>,
    workspace_root: Option<String>,
}

fn wants_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    let sse = wants_sse(&headers);
    let (tx, rx) = mpsc::channel::<AgentEvent>(EVENT_CHANNEL_CAPACITY);

    // Decision replies re-enter the waiting session.
    if let Some(decision) = body.decision {
        let Some(session_id) = body.session_id.clone() else {
            return error_response(&Error::user("decision requires sessionId"));
        };
        let runtime_state = state.clone();
        tokio::spawn(async move {
            let result = runtime_state
                .runtime
                .resume_with_decision(&session_id, decision, tx.clone(), INTERACTIVE_MAX_STEPS)
                .await;
            if let Err(e) = result {
                let _ = tx.send(AgentEvent::final_text(e.user_message())).await;
            }
        });
        return event_response(rx, sse).await;
    }

    let Some(message) = body.message.clone().filter(|m| !m.trim().is_empty()) else {
        return error_response(&Error::user("missing required field: message"));
    };

    let mode = if body.agent_plus {
        Mode::AgentPlus
    } else if body.auto_mode {
        Mode::Agent
    } else {
        Mode::Chat
    };

    if mode == Mode::Chat {
        return chat_stream_response(state, body, message, sse).await;
    }

    let workspace_root = body
        .workspace_root
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.workspace_root.clone());
    let session_id = body
        .session_id
        .clone()
        .unwrap_or_else(|| format!("session-{}", uuid_fragment()));

    let request = TurnRequest {
        session_id,
        message,
        mode,
        model: body.model.clone(),
        workspace_root,
        context: body.context,
        max_steps: INTERACTIVE_MAX_STEPS,
        disable_delegation: false,
    };

    let runtime_state = state.clone();
    tokio::spawn(async move {
        runtime_state.runtime.run_turn(request, tx).await;
    });
    event_response(rx, sse).await
}

/// Plain streaming chat: raw provider deltas as `chunk` frames, then `done`.
async fn chat_stream_response(
    state: Arc<AppState>,
    body: ChatBody,
    message: String,
    sse: bool,
) -> Response {
    let model = match body.model.or(state.config.read().await.model.clone()) {
        Some(model) => model,
        None => return error_response(&Error::user("no model selected")),
    };

    let mut content = message;
    for attachment in &body.context {
        content.push_str(&format!(
            "\n\nAttached file {}:\n```\n{}\n```",
            attachment.path, attachment.content
        ));
    }
    let messages = vec![ChatMessage::new("user", content)];

    let (tx, rx) = mpsc::channel::<AgentEvent>(EVENT_CHANNEL_CAPACITY);
    let provider = state.provider.clone();
    tokio::spawn(async move {
        let options = CallOptions::default();
        match provider.stream(&model, &messages, &options).await {
            Ok(mut stream) => {
                while let Some(delta) = stream.next().await {
                    match delta {
                        Ok(chunk) => {
                            let _ = tx.send(AgentEvent::Chunk { content: chunk }).await;
                        }
                        Err(e) => {
                            let _ = tx.send(AgentEvent::error(e.to_string())).await;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(AgentEvent::error(e.to_string())).await;
            }
        }
        let _ = tx.send(AgentEvent::Done).await;
    });
    event_response(rx, sse).await
}

/// Frame events as SSE, or collect them into one JSON body for clients that
/// did not ask for a stream.
async fn event_response(rx: mpsc::Receiver<AgentEvent>, sse: bool) -> Response {
    if sse {
        let stream = ReceiverStream::new(rx).map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok::<Event, std::convert::Infallible>(Event::default().data(data))
        });
        return Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    }

    let mut events: Vec<AgentEvent> = Vec::new();
    let mut rx = rx;
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let content = events
        .iter()
        .rev()
        .find_map(|event| match event {
            AgentEvent::Final { content } => Some(content.clone()),
            _ => None,
        })
        .unwrap_or_else(|| {
            events
                .iter()
                .filter_map(|event| match event {
                    AgentEvent::Chunk { content } => Some(content.as_str()),
                    _ => None,
                })
                .collect()
        });
    Json(json!({ "events": events, "content": content })).into_response()
}

fn uuid_fragment() -> String {
    // Enough uniqueness for client-less session ids.
    format!("{:x}", std::process::id() as u64 ^ chrono::Utc::now().timestamp_micros() as u64)
}

fn load_workspace_tool_servers(
    workspace: &std::path::Path,
) -> std::result::Result<Vec<isocode_core::ToolServerConfig>, String> {
    let path = workspace.join(".isocode").join("mcp-servers.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| format!("invalid JSON tool-server config: {}", e))
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::User(_) | Error::Parse(_) => StatusCode::BAD_REQUEST,
        Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.user_message() }))).into_response()
}
