//! External tool servers — JSON-RPC 2.0 over newline-delimited child stdio.
//!
//! Each configured server is spawned on first use (or after the server list
//! changes, detected by hashing it). The handshake is `initialize` with a
//! 10 s timeout followed by `tools/list`; a server that fails either step is
//! recorded as failed and surfaces that error on every attempted use.
//! Requests are correlated by integer ids.

use isocode_core::ToolServerConfig;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

const INIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type Waiters = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

#[derive(Clone, Debug, serde::Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: Vec<String>,
}

struct ServerHandle {
    _child: Child,
    stdin: ChildStdin,
    waiters: Waiters,
    next_id: u64,
    tools: Vec<String>,
}

enum ServerState {
    Ready(ServerHandle),
    Failed(String),
}

#[derive(Default)]
struct PoolState {
    desired: Vec<ToolServerConfig>,
    running_hash: Option<u64>,
    servers: HashMap<String, ServerState>,
}

/// Process-wide pool of external tool-server children, shared across
/// sessions.
#[derive(Default)]
pub struct ToolServerPool {
    state: Mutex<PoolState>,
}

impl ToolServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the desired server list. Children are (re)spawned lazily on
    /// the next use if the list changed.
    pub async fn configure(&self, configs: &[ToolServerConfig]) {
        let mut state = self.state.lock().await;
        state.desired = configs.to_vec();
    }

    pub async fn status(&self) -> Vec<ServerStatus> {
        let mut state = self.state.lock().await;
        Self::ensure_started(&mut state).await;
        state
            .servers
            .iter()
            .map(|(name, server)| match server {
                ServerState::Ready(handle) => ServerStatus {
                    name: name.clone(),
                    ok: true,
                    error: None,
                    tools: handle.tools.clone(),
                },
                ServerState::Failed(error) => ServerStatus {
                    name: name.clone(),
                    ok: false,
                    error: Some(error.clone()),
                    tools: Vec::new(),
                },
            })
            .collect()
    }

    /// Invoke a tool on a named server.
    pub async fn call(&self, server: &str, tool: &str, args: Value) -> Result<Value, String> {
        let mut state = self.state.lock().await;
        Self::ensure_started(&mut state).await;
        let handle = match state.servers.get_mut(server) {
            Some(ServerState::Ready(handle)) => handle,
            Some(ServerState::Failed(error)) => {
                return Err(format!("server '{}' failed to start: {}", server, error))
            }
            None => {
                let known: Vec<&str> = state.servers.keys().map(|s| s.as_str()).collect();
                return Err(format!(
                    "unknown tool server '{}' (configured: {})",
                    server,
                    known.join(", ")
                ));
            }
        };
        request(
            handle,
            "tools/call",
            json!({ "name": tool, "arguments": args }),
            CALL_TIMEOUT,
        )
        .await
    }

    async fn ensure_started(state: &mut PoolState) {
        let hash = config_hash(&state.desired);
        if state.running_hash == Some(hash) {
            return;
        }
        debug!("tool-server config changed, (re)spawning {} servers", state.desired.len());
        state.servers.clear();
        for config in state.desired.clone() {
            let server = match spawn_server(&config).await {
                Ok(handle) => ServerState::Ready(handle),
                Err(error) => {
                    warn!("tool server '{}' failed: {}", config.name, error);
                    ServerState::Failed(error)
                }
            };
            state.servers.insert(config.name.clone(), server);
        }
        state.running_hash = Some(hash);
    }
}

fn config_hash(configs: &[ToolServerConfig]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for config in configs {
        config.name.hash(&mut hasher);
        config.command.hash(&mut hasher);
        config.args.hash(&mut hasher);
    }
    hasher.finish()
}

async fn spawn_server(config: &ToolServerConfig) -> Result<ServerHandle, String> {
    let mut child = Command::new(&config.command)
        .args(&config.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn '{}': {}", config.command, e))?;

    let stdin = child.stdin.take().ok_or("no stdin handle")?;
    let stdout = child.stdout.take().ok_or("no stdout handle")?;
    let waiters: Waiters = Arc::default();

    // Reader task: resolve waiters by response id.
    let reader_waiters = waiters.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = value["id"].as_u64() else {
                continue; // notification, nothing waits on it
            };
            let waiter = reader_waiters.lock().unwrap().remove(&id);
            if let Some(tx) = waiter {
                let outcome = if let Some(error) = value.get("error") {
                    Err(error["message"]
                        .as_str()
                        .unwrap_or("unknown error")
                        .to_string())
                } else {
                    Ok(value["result"].clone())
                };
                let _ = tx.send(outcome);
            }
        }
    });

    let mut handle = ServerHandle {
        _child: child,
        stdin,
        waiters,
        next_id: 0,
        tools: Vec::new(),
    };

    // Handshake failure is a hard error for this server.
    request(
        &mut handle,
        "initialize",
        json!({ "protocolVersion": "2024-11-05", "capabilities": {} }),
        INIT_TIMEOUT,
    )
    .await
    .map_err(|e| format!("initialize: {}", e))?;

    let listed = request(&mut handle, "tools/list", json!({}), INIT_TIMEOUT)
        .await
        .map_err(|e| format!("tools/list: {}", e))?;
    handle.tools = listed["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t["name"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    debug!("tool server '{}' ready with {} tools", config.name, handle.tools.len());
    Ok(handle)
}

async fn request(
    handle: &mut ServerHandle,
    method: &str,
    params: Value,
    timeout: std::time::Duration,
) -> Result<Value, String> {
    handle.next_id += 1;
    let id = handle.next_id;
    let (tx, rx) = oneshot::channel();
    handle.waiters.lock().unwrap().insert(id, tx);

    let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    let mut line = frame.to_string();
    line.push('\n');
    handle
        .stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("write: {}", e))?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err("server closed the connection".to_string()),
        Err(_) => {
            handle.waiters.lock().unwrap().remove(&id);
            Err(format!("{} timed out after {:?}", method, timeout))
        }
    }
}
