//! REST endpoints for session management (spec.md §6 core HTTP surface).
//!
//! - `GET    /api/sessions`            — list, HQ-aware
//! - `POST   /api/sessions`            — create
//! - `GET    /api/sessions/:id`        — session record
//! - `DELETE /api/sessions/:id`        — request kill
//! - `POST   /api/sessions/:id/input`  — deliver stdin
//! - `POST   /api/sessions/:id/resize` — resize the pty
//! - `GET    /api/sessions/:id/text`   — current screen as plain text
//! - `POST   /api/cleanup-exited`      — reap exited sessions

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::hq::HqRequestBody;
use crate::ipc::Frame;
use crate::sessions::launch::{spawn_forwarder, LaunchRequest};
use crate::sessions::record::{SessionRecord, TitleMode};
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    pub working_dir: String,
    pub name: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub title_mode: Option<String>,
    pub remote_id: Option<String>,
}

#[derive(Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

fn parse_title_mode(mode: Option<&str>) -> TitleMode {
    match mode {
        Some("filter") => TitleMode::Filter,
        Some("static") => TitleMode::Static,
        Some("dynamic") => TitleMode::Dynamic,
        _ => TitleMode::None,
    }
}

fn session_to_json(record: &SessionRecord) -> Value {
    json!({
        "sessionId": record.id,
        "name": record.name,
        "command": record.command,
        "workingDir": record.working_dir,
        "cols": record.cols,
        "rows": record.rows,
        "startedAt": record.started_at,
        "status": record.status,
        "exitCode": record.exit_code,
        "pid": record.pid,
        "remoteId": record.remote_id,
    })
}

/// `GET /api/sessions` — local sessions unioned with every connected
/// remote's sessions when running in HQ mode, per spec.md §4.12.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let mut sessions: Vec<Value> = state.session_manager.list().await.iter().map(session_to_json).collect();
    if let Some(hq) = &state.hq {
        sessions.extend(hq.list_remote_sessions().await);
    }
    Json(json!({ "sessions": sessions }))
}

/// `POST /api/sessions` — spawns the forwarder that owns the new session end
/// to end, or proxies creation to the named remote when `remoteId` is given.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>, CoreError> {
    if req.command.is_empty() {
        return Err(CoreError::Validation("command must not be empty".into()));
    }

    if let Some(remote_id) = &req.remote_id {
        let Some(hq) = &state.hq else {
            return Err(CoreError::Validation("this server is not running in HQ mode".into()));
        };
        let body = HqRequestBody::CreateSession {
            command: req.command,
            working_dir: req.working_dir,
            name: req.name,
            cols: req.cols,
            rows: req.rows,
        };
        return match hq.proxy_request(remote_id, body).await? {
            crate::hq::HqResponseBody::Ok(value) => Ok(Json(value)),
            crate::hq::HqResponseBody::Error { error, status } => {
                Err(remote_error_to_core(&error, status))
            }
        };
    }

    let launch = LaunchRequest {
        command: req.command,
        working_dir: Some(req.working_dir),
        name: req.name,
        cols: req.cols,
        rows: req.rows,
        title_mode: Some(parse_title_mode(req.title_mode.as_deref())),
    };
    let session_id = spawn_forwarder(&state.config, launch).await?;
    Ok(Json(json!({ "sessionId": session_id })))
}

/// `GET /api/sessions/:id` — falls back to proxying a remote lookup when the
/// id isn't owned locally and this server is an HQ.
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, CoreError> {
    match state.session_manager.load(&id).await {
        Ok(record) => Ok(Json(session_to_json(&record))),
        Err(local_err) => match find_remote_owner(&state, &id).await {
            Some(remote_id) => {
                let hq = state.hq.as_ref().expect("find_remote_owner only returns Some when hq is configured");
                match hq.proxy_request(&remote_id, HqRequestBody::GetSession { session_id: id }).await? {
                    crate::hq::HqResponseBody::Ok(value) => Ok(Json(value)),
                    crate::hq::HqResponseBody::Error { error, status } => Err(remote_error_to_core(&error, status)),
                }
            }
            None => Err(local_err),
        },
    }
}

/// `DELETE /api/sessions/:id` — requests a kill by delivering `SIGTERM` over
/// the session's IPC socket; the forwarder forwards it to the child and
/// records the exit once it happens.
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, CoreError> {
    if state.session_manager.load(&id).await.is_ok() {
        let frame = Frame::signal(id.clone(), libc::SIGTERM as u8);
        send_local(&state, &id, frame).await?;
        return Ok(StatusCode::ACCEPTED);
    }
    proxy_remote_unit(&state, &id, HqRequestBody::DeleteSession { session_id: id.clone() }).await
}

pub async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<StatusCode, CoreError> {
    if state.session_manager.load(&id).await.is_ok() {
        let frame = Frame::new(crate::ipc::FrameType::InputText, id.clone(), req.text.into_bytes());
        send_local(&state, &id, frame).await?;
        return Ok(StatusCode::NO_CONTENT);
    }
    proxy_remote_unit(&state, &id, HqRequestBody::Input { session_id: id.clone(), text: req.text }).await
}

pub async fn resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<StatusCode, CoreError> {
    if state.session_manager.load(&id).await.is_ok() {
        let frame = Frame::resize(id.clone(), req.cols, req.rows);
        send_local(&state, &id, frame).await?;
        return Ok(StatusCode::NO_CONTENT);
    }
    proxy_remote_unit(&state, &id, HqRequestBody::Resize { session_id: id.clone(), cols: req.cols, rows: req.rows }).await
}

/// `GET /api/sessions/:id/text` — current screen rendered through the vt100
/// emulator, for clients that just want a snapshot rather than a live feed.
pub async fn text(State(state): State<AppState>, Path(id): Path<String>) -> Result<String, CoreError> {
    match state.hub.render_text(&id).await {
        Ok(text) => Ok(text),
        Err(local_err) => match find_remote_owner(&state, &id).await {
            Some(remote_id) => {
                let hq = state.hq.as_ref().expect("find_remote_owner only returns Some when hq is configured");
                match hq.proxy_request(&remote_id, HqRequestBody::GetText { session_id: id }).await? {
                    crate::hq::HqResponseBody::Ok(value) => {
                        Ok(value.get("text").and_then(Value::as_str).unwrap_or_default().to_string())
                    }
                    crate::hq::HqResponseBody::Error { error, status } => Err(remote_error_to_core(&error, status)),
                }
            }
            None => Err(local_err),
        },
    }
}

/// `POST /api/cleanup-exited` — removes every session directory whose record
/// reports `exited` status.
pub async fn cleanup_exited(State(state): State<AppState>) -> Json<Value> {
    let mut reaped = Vec::new();
    for record in state.session_manager.list().await {
        if record.status == crate::sessions::record::SessionStatus::Exited
            && state.session_manager.cleanup(&record.id).await.is_ok()
        {
            reaped.push(record.id);
        }
    }
    Json(json!({ "reaped": reaped }))
}

async fn send_local(state: &AppState, session_id: &str, frame: Frame) -> Result<(), CoreError> {
    let paths = state.session_manager.paths(session_id);
    crate::ipc::socket::send_once(&paths.ipc_socket(), &frame).await
}

/// Finds which connected remote (if any) owns `session_id`, for HQ-mode
/// fallback when a lookup misses locally.
async fn find_remote_owner(state: &AppState, session_id: &str) -> Option<String> {
    let hq = state.hq.as_ref()?;
    for session in hq.list_remote_sessions().await {
        if session.get("sessionId").and_then(Value::as_str) == Some(session_id) {
            return session.get("remoteId").and_then(Value::as_str).map(str::to_string);
        }
    }
    None
}

async fn proxy_remote_unit(state: &AppState, session_id: &str, body: HqRequestBody) -> Result<StatusCode, CoreError> {
    let Some(remote_id) = find_remote_owner(state, session_id).await else {
        return Err(CoreError::NotFound(format!("session {session_id}")));
    };
    let hq = state.hq.as_ref().expect("find_remote_owner only returns Some when hq is configured");
    match hq.proxy_request(&remote_id, body).await? {
        crate::hq::HqResponseBody::Ok(_) => Ok(StatusCode::NO_CONTENT),
        crate::hq::HqResponseBody::Error { error, status } => Err(remote_error_to_core(&error, status)),
    }
}

fn remote_error_to_core(error: &str, status: u16) -> CoreError {
    match status {
        404 => CoreError::NotFound(error.to_string()),
        400 => CoreError::Validation(error.to_string()),
        _ => CoreError::ForwarderUnreachable(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::record::EnvSnapshot;

    #[test]
    fn session_to_json_uses_camel_case_keys() {
        let record = SessionRecord::new(
            "abc123".into(),
            "bash".into(),
            vec!["bash".into()],
            "/tmp".into(),
            EnvSnapshot::default(),
            80,
            24,
        );
        let value = session_to_json(&record);
        assert_eq!(value["sessionId"], "abc123");
        assert_eq!(value["workingDir"], "/tmp");
        assert_eq!(value["exitCode"], serde_json::Value::Null);
    }

    #[test]
    fn parse_title_mode_defaults_to_none() {
        assert_eq!(parse_title_mode(None), TitleMode::None);
        assert_eq!(parse_title_mode(Some("bogus")), TitleMode::None);
        assert_eq!(parse_title_mode(Some("dynamic")), TitleMode::Dynamic);
    }

    #[test]
    fn remote_error_to_core_maps_status_codes() {
        assert!(matches!(remote_error_to_core("x", 404), CoreError::NotFound(_)));
        assert!(matches!(remote_error_to_core("x", 400), CoreError::Validation(_)));
        assert!(matches!(remote_error_to_core("x", 502), CoreError::ForwarderUnreachable(_)));
    }
}
