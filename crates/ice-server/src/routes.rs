use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use ice_core::{
    OpenRequestBody, ProcessSupervisor, SpawnRequest, SupervisorError, SupervisorRegistry,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub fn router(registry: SupervisorRegistry) -> Router {
    Router::new()
        .route("/", get(list_processes).post(create_process))
        .route("/health", get(|| async { "ok" }))
        .route("/notifications", get(notifications_handler))
        .route("/openRequest", post(open_request))
        .route("/:pid/resize", post(resize_process))
        .route("/:pid/kill", post(kill_process))
        .route("/:pid/pause", post(pause_process))
        .route("/:pid/resume", post(resume_process))
        .route("/:pid/clear", post(clear_process))
        .route("/:pid/wait", get(wait_process))
        .route("/:pid/attach", get(attach_handler))
        .with_state(registry)
}

enum ApiError {
    Supervisor(SupervisorError),
    InvalidRequest,
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError::Supervisor(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        debug!(event = "request_invalid", error = %err);
        ApiError::InvalidRequest
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Supervisor(err @ SupervisorError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": err.to_string() }))).into_response()
            }
            ApiError::Supervisor(err) if err.is_client_error() => {
                let body = Json(json!({ "detail": err.to_string() }));
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            ApiError::Supervisor(err) => {
                warn!(event = "request_failed", error = %err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": err.to_string() })),
                )
                    .into_response()
            }
            ApiError::InvalidRequest => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": "Invalid request" })),
            )
                .into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
struct KillQuery {
    #[serde(default)]
    signal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(default)]
    timeout: Option<u64>,
}

async fn list_processes(State(registry): State<SupervisorRegistry>) -> impl IntoResponse {
    Json(registry.list())
}

async fn create_process(
    State(registry): State<SupervisorRegistry>,
    body: Result<Json<SpawnRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body?;
    let supervisor = registry.create(&request).map_err(|err| {
        warn!(event = "spawn_failed", cmd = %request.cmd(), error = %err);
        err
    })?;
    Ok((StatusCode::CREATED, Json(supervisor.snapshot())))
}

async fn open_request(
    State(registry): State<SupervisorRegistry>,
    body: Result<Json<OpenRequestBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    Ok(Json(registry.open_file(&body)))
}

async fn resize_process(
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
    body: Result<Json<ResizeBody>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let supervisor = registry.get(pid)?;
    let Json(size) = body?;
    supervisor.resize(size.cols, size.rows);
    Ok(StatusCode::OK)
}

/// Signals the process and answers once its exit has been observed.
async fn kill_process(
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
    Query(query): Query<KillQuery>,
) -> ApiResult<impl IntoResponse> {
    let supervisor = registry.get(pid)?;
    supervisor.kill(query.signal.as_deref())?;
    Ok(Json(supervisor.wait(None).await))
}

async fn pause_process(
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
) -> ApiResult<StatusCode> {
    registry.get(pid)?.pause();
    Ok(StatusCode::OK)
}

async fn resume_process(
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
) -> ApiResult<StatusCode> {
    registry.get(pid)?.resume();
    Ok(StatusCode::OK)
}

async fn clear_process(
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
) -> ApiResult<StatusCode> {
    registry.get(pid)?.clear();
    Ok(StatusCode::OK)
}

async fn wait_process(
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<impl IntoResponse> {
    let supervisor = registry.get(pid)?;
    let timeout = query.timeout.map(Duration::from_millis);
    Ok(Json(supervisor.wait(timeout).await))
}

async fn attach_handler(
    ws: WebSocketUpgrade,
    State(registry): State<SupervisorRegistry>,
    Path(pid): Path<u32>,
) -> ApiResult<Response> {
    let supervisor = registry.get(pid)?;
    Ok(ws.on_upgrade(move |socket| attach_socket(socket, supervisor)))
}

async fn attach_socket(socket: WebSocket, supervisor: ProcessSupervisor) {
    let pid = supervisor.pid();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let subscription = supervisor.on_data(move |chunk| {
        let _ = tx.send(chunk.clone());
    });
    supervisor.resume();
    info!(event = "terminal_attached", pid);

    let waiter = supervisor.clone();
    let mut write_task = tokio::spawn(async move {
        let exited = waiter.wait(None);
        tokio::pin!(exited);
        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if ws_sender.send(Message::Binary(chunk)).await.is_err() {
                        return;
                    }
                }
                _ = &mut exited => {
                    while let Ok(chunk) = rx.try_recv() {
                        if ws_sender.send(Message::Binary(chunk)).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut write_task => break,
            message = ws_receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => supervisor.write(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => supervisor.write(&bytes),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(event = "attach_read_error", pid, error = %err);
                        break;
                    }
                }
            }
        }
    }

    supervisor.off_data(subscription);
    write_task.abort();
    info!(event = "terminal_detached", pid);
}

async fn notifications_handler(
    ws: WebSocketUpgrade,
    State(registry): State<SupervisorRegistry>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| notifications_socket(socket, registry))
}

async fn notifications_socket(socket: WebSocket, registry: SupervisorRegistry) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let subscription = registry.notifications().subscribe(move |notification| {
        match serde_json::to_string(notification) {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(err) => warn!(event = "notification_encode_failed", error = %err),
        }
    });
    debug!(event = "notifications_subscribed");

    let mut write_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut write_task => break,
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    registry.notifications().unsubscribe(subscription);
    write_task.abort();
    debug!(event = "notifications_unsubscribed");
}
