//! A small in-process Jupyter Server for integration tests.
//!
//! Serves the kernels REST API under a configurable path and a channels
//! WebSocket whose "kernel" understands three kinds of code:
//!
//! - `print(X)` streams `X\n` to stdout
//! - `raise X` fails with an `error` output
//! - `input(P)` asks for a line on stdin with prompt `P` and streams it back
//!
//! Anything else produces an `execute_result` whose text is the code itself.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

pub struct FakeServerConfig {
    /// Where the kernels API is mounted, e.g. `/api/kernels`.
    pub api_path: String,
    pub token: Option<String>,
    /// `execution_state` reported by `GET <api>/<id>`.
    pub execution_state: String,
}

impl Default for FakeServerConfig {
    fn default() -> Self {
        Self {
            api_path: "/api/kernels".to_string(),
            token: Some("secret".to_string()),
            execution_state: "idle".to_string(),
        }
    }
}

#[derive(Default)]
struct ServerLog {
    /// `"<METHOD> <path>"` for every HTTP request, in arrival order.
    requests: Vec<String>,
    /// `Authorization` header of every request, `None` if absent.
    auth: Vec<Option<String>>,
    kernels: Vec<String>,
    /// Every frame the client sent over any socket.
    received: Vec<Value>,
}

struct ServerState {
    token: Option<String>,
    execution_state: Mutex<String>,
    log: Mutex<ServerLog>,
}

type Shared = Arc<ServerState>;

pub struct FakeServer {
    pub addr: SocketAddr,
    state: Shared,
    task: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(config: FakeServerConfig) -> Self {
        let state = Arc::new(ServerState {
            token: config.token,
            execution_state: Mutex::new(config.execution_state),
            log: Mutex::new(ServerLog::default()),
        });

        let api = config.api_path;
        let app = Router::new()
            .route(&api, get(list_kernels).post(start_kernel))
            .route(
                &format!("{}/:kernel_id", api),
                get(kernel_model).delete(delete_kernel),
            )
            .route(&format!("{}/:kernel_id/interrupt", api), post(interrupt_kernel))
            .route(&format!("{}/:kernel_id/restart", api), post(restart_kernel))
            .route(&format!("{}/:kernel_id/channels", api), get(channels))
            .fallback(not_found)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state, task }
    }

    /// Server URL as a user would paste it, with `path` and the token.
    pub fn url(&self, path: &str) -> String {
        match &self.state.token {
            Some(token) => format!("http://{}{}?token={}", self.addr, path, token),
            None => format!("http://{}{}", self.addr, path),
        }
    }

    pub fn set_execution_state(&self, state: &str) {
        *self.state.execution_state.lock().unwrap() = state.to_string();
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.log.lock().unwrap().requests.clone()
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.state.log.lock().unwrap().auth.clone()
    }

    pub fn kernels(&self) -> Vec<String> {
        self.state.log.lock().unwrap().kernels.clone()
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.log.lock().unwrap().received.clone()
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn record(
    state: &Shared,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<(), StatusCode> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    {
        let mut log = state.log.lock().unwrap();
        log.requests.push(format!("{} {}", method, uri.path()));
        log.auth.push(auth.clone());
    }
    match &state.token {
        Some(token) if auth.as_deref() != Some(format!("token {}", token).as_str()) => {
            Err(StatusCode::FORBIDDEN)
        }
        _ => Ok(()),
    }
}

fn model(state: &Shared, id: &str) -> Value {
    json!({
        "id": id,
        "name": "python3",
        "execution_state": state.execution_state.lock().unwrap().clone(),
        "connections": 0
    })
}

async fn not_found(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> StatusCode {
    let _ = record(&state, &method, &uri, &headers);
    StatusCode::NOT_FOUND
}

async fn list_kernels(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    record(&state, &method, &uri, &headers)?;
    let ids = state.log.lock().unwrap().kernels.clone();
    Ok(Json(Value::Array(ids.iter().map(|id| model(&state, id)).collect())))
}

async fn start_kernel(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    record(&state, &method, &uri, &headers)?;
    if body.get("name").and_then(Value::as_str).is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let id = uuid::Uuid::new_v4().to_string();
    state.log.lock().unwrap().kernels.push(id.clone());
    Ok((StatusCode::CREATED, Json(model(&state, &id))))
}

async fn kernel_model(
    State(state): State<Shared>,
    Path(kernel_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    record(&state, &method, &uri, &headers)?;
    if !state.log.lock().unwrap().kernels.contains(&kernel_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(model(&state, &kernel_id)))
}

async fn delete_kernel(
    State(state): State<Shared>,
    Path(kernel_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> StatusCode {
    if let Err(status) = record(&state, &method, &uri, &headers) {
        return status;
    }
    let mut log = state.log.lock().unwrap();
    let before = log.kernels.len();
    log.kernels.retain(|id| *id != kernel_id);
    if log.kernels.len() == before {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn interrupt_kernel(
    State(state): State<Shared>,
    Path(_kernel_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> StatusCode {
    match record(&state, &method, &uri, &headers) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(status) => status,
    }
}

async fn restart_kernel(
    State(state): State<Shared>,
    Path(kernel_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    record(&state, &method, &uri, &headers)?;
    Ok(Json(model(&state, &kernel_id)))
}

async fn channels(
    State(state): State<Shared>,
    Path(_kernel_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(status) = record(&state, &method, &uri, &headers) {
        return status.into_response();
    }
    ws.on_upgrade(move |socket| run_kernel(socket, state))
}

fn frame(msg_type: &str, channel: &str, parent: &Value, content: Value) -> Message {
    let value = json!({
        "header": {
            "msg_id": uuid::Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "session": "fake-kernel",
            "username": "kernel",
            "version": "5.3",
            "date": "2024-01-01T00:00:00.000000Z"
        },
        "parent_header": parent,
        "metadata": {},
        "content": content,
        "channel": channel
    });
    Message::Text(value.to_string())
}

fn status(parent: &Value, execution_state: &str) -> Message {
    frame(
        "status",
        "iopub",
        parent,
        json!({ "execution_state": execution_state }),
    )
}

fn argument<'a>(code: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = code.trim().strip_prefix(prefix)?;
    Some(rest.strip_suffix(')').unwrap_or(rest).trim_matches(|c| c == '"' || c == '\''))
}

async fn run_kernel(mut socket: WebSocket, state: Shared) {
    let mut execution_count: u64 = 0;

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.log.lock().unwrap().received.push(request.clone());

        if request["header"]["msg_type"] != "execute_request" {
            continue;
        }
        let parent = request["header"].clone();
        let code = request["content"]["code"].as_str().unwrap_or_default().to_string();
        execution_count += 1;

        let mut replies = vec![
            status(&parent, "busy"),
            frame(
                "execute_input",
                "iopub",
                &parent,
                json!({ "code": code, "execution_count": execution_count }),
            ),
        ];

        let mut ok = true;
        if let Some(text) = argument(&code, "print(") {
            replies.push(frame(
                "stream",
                "iopub",
                &parent,
                json!({ "name": "stdout", "text": format!("{}\n", text) }),
            ));
        } else if let Some(name) = argument(&code, "raise ") {
            ok = false;
            replies.push(frame(
                "error",
                "iopub",
                &parent,
                json!({
                    "ename": name,
                    "evalue": "raised",
                    "traceback": [format!("{}: raised", name)]
                }),
            ));
        } else if let Some(prompt) = argument(&code, "input(") {
            for reply in replies.drain(..) {
                if socket.send(reply).await.is_err() {
                    return;
                }
            }
            let ask = frame(
                "input_request",
                "stdin",
                &parent,
                json!({ "prompt": prompt, "password": false }),
            );
            if socket.send(ask).await.is_err() {
                return;
            }
            let answer = match wait_for_input_reply(&mut socket, &state).await {
                Some(answer) => answer,
                None => return,
            };
            replies.push(frame(
                "stream",
                "iopub",
                &parent,
                json!({ "name": "stdout", "text": format!("{}\n", answer) }),
            ));
        } else {
            replies.push(frame(
                "execute_result",
                "iopub",
                &parent,
                json!({
                    "data": { "text/plain": code },
                    "metadata": {},
                    "execution_count": execution_count
                }),
            ));
        }

        replies.push(frame(
            "execute_reply",
            "shell",
            &parent,
            json!({
                "status": if ok { "ok" } else { "error" },
                "execution_count": execution_count
            }),
        ));
        replies.push(status(&parent, "idle"));

        for reply in replies {
            if socket.send(reply).await.is_err() {
                return;
            }
        }
    }
}

async fn wait_for_input_reply(socket: &mut WebSocket, state: &Shared) -> Option<String> {
    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return None,
            message = socket.recv() => {
                let Some(Ok(Message::Text(text))) = message else {
                    return None;
                };
                let Ok(reply) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                state.log.lock().unwrap().received.push(reply.clone());
                if reply["header"]["msg_type"] == "input_reply" {
                    return reply["content"]["value"].as_str().map(String::from);
                }
            }
        }
    }
}
