//! Error taxonomy shared across the journal, session, and transport layers.
//!
//! Each kind maps to the propagation policy in spec §7: not-found becomes a
//! 404 or WS `Error` frame, validation errors are never retried, transient
//! I/O is retried once by the caller, permanent I/O closes the writer.

/// A typed error code plus a short human message, the shape every
/// user-visible failure surface (HTTP body, WS `Error` frame) takes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("permanent I/O error: {0}")]
    PermanentIo(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("pruning detection error: {0}")]
    Pruning(String),

    #[error("forwarder unreachable: {0}")]
    ForwarderUnreachable(String),
}

impl CoreError {
    /// Stable short code used in WS `Error` frames and HTTP JSON bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Validation(_) => "Validation",
            Self::TransientIo(_) => "TransientIo",
            Self::PermanentIo(_) => "PermanentIo",
            Self::Transport(_) => "Transport",
            Self::Parse(_) => "Parse",
            Self::Pruning(_) => "Pruning",
            Self::ForwarderUnreachable(_) => "ForwarderUnreachable",
        }
    }

    /// Numeric code carried by the binary `Error` frame (§4.7).
    pub fn frame_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 1,
            Self::Validation(_) => 2,
            Self::TransientIo(_) => 3,
            Self::PermanentIo(_) => 4,
            Self::Transport(_) => 5,
            Self::Parse(_) => 6,
            Self::Pruning(_) => 7,
            Self::ForwarderUnreachable(_) => 8,
        }
    }

    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::TransientIo(_) | Self::PermanentIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Parse(_) => StatusCode::BAD_REQUEST,
            Self::Pruning(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ForwarderUnreachable(_) => StatusCode::CONFLICT,
        }
    }
}

impl axum::response::IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = self.http_status();
        let body = axum::Json(serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        (status, body).into_response()
    }
}

/// Classify a raw I/O error as transient or permanent at the call site.
pub fn classify_io(err: &std::io::Error, transient: bool) -> CoreError {
    if transient {
        CoreError::TransientIo(err.to_string())
    } else {
        CoreError::PermanentIo(err.to_string())
    }
}
