use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use flowrun_core::event::Event;
use flowrun_core::types::ExecutionId;

use crate::auth;
use crate::middleware::Authenticated;
use crate::protocol::{
    ApiError, ApprovalRequest, ApprovalResponse, CancelResponse, ListQuery, SeqQuery,
    SubmitRequest,
};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

fn require_viewer(auth_result: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_viewer_access(&auth_result.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

fn require_operator(auth_result: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_operator_access(&auth_result.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

// GET /api/health: no auth required
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /api/flows: requires Viewer+
pub async fn list_flows(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_viewer(&auth_result)?;
    let flows = state.engine.flows().await?;
    Ok(Json(serde_json::json!({ "flows": flows })))
}

// POST /api/flows/{id}/executions: requires Operator+
pub async fn submit_execution(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    require_operator(&auth_result)?;
    // An empty body submits with the flow's defaults.
    let request: SubmitRequest = if body.is_empty() {
        SubmitRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let summary = state.engine.submit(&flow_id, request.variables).await?;
    info!(
        execution_id = %summary.id,
        flow_id = %flow_id,
        caller = %auth_result.name,
        "Execution submitted over HTTP"
    );
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

// GET /api/executions?limit=50: requires Viewer+
pub async fn list_executions(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_viewer(&auth_result)?;
    let executions = state.engine.list(q.limit).await?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

// GET /api/executions/{id}: requires Viewer+
pub async fn get_execution(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    require_viewer(&auth_result)?;
    let execution = state.engine.execution(&ExecutionId::from_string(&id)).await?;
    Ok(Json(execution))
}

// POST /api/executions/{id}/cancel: requires Operator+
pub async fn cancel_execution(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    require_operator(&auth_result)?;
    let id = ExecutionId::from_string(&id);
    let status = state.engine.cancel(&id).await?;
    Ok(Json(CancelResponse { id, status }))
}

// POST /api/executions/{id}/approval: requires Operator+
pub async fn submit_approval(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ApprovalRequest>,
) -> ApiResult<Json<ApprovalResponse>> {
    require_operator(&auth_result)?;
    let id = ExecutionId::from_string(&id);
    let step_id = state
        .engine
        .submit_approval(&id, body.approved, body.reason, body.step_id.as_deref())
        .await?;
    Ok(Json(ApprovalResponse { id, step_id }))
}

// GET /api/executions/{id}/events?from_seq=N: requires Viewer+
pub async fn list_events(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<SeqQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_viewer(&auth_result)?;
    let id = ExecutionId::from_string(&id);
    // Unknown ids are a 404 rather than an empty log.
    state.engine.execution(&id).await?;
    let events = state.engine.events(&id, q.from_seq).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}

// GET /api/executions/{id}/stream?from_seq=N: WebSocket, requires Viewer+
pub async fn stream_events(
    ws: WebSocketUpgrade,
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<SeqQuery>,
) -> ApiResult<impl IntoResponse> {
    require_viewer(&auth_result)?;
    let id = ExecutionId::from_string(&id);
    state.engine.execution(&id).await?;
    let events = state.engine.subscribe(&id, q.from_seq).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, id, events)))
}

/// Push events as JSON text frames until the terminal event or the client
/// goes away.
async fn forward_events(socket: WebSocket, id: ExecutionId, mut events: BoxStream<'static, Event>) {
    info!(execution_id = %id, "Event stream client connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(execution_id = %id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    debug!(execution_id = %id, "Event stream client went away");
                    return;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        debug!(execution_id = %id, "Event stream client disconnected");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    debug!(execution_id = %id, "Event stream finished");
}
