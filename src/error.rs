use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

// ─── Surface error taxonomy ──────────────────────────────────────────────────

/// Structured error hierarchy for `browsergrid`.
///
/// Every variant maps to a stable surface code and an HTTP status; handlers
/// return these directly and the `IntoResponse` impl renders the JSON body.
/// Internal plumbing keeps using `anyhow::Result` and is wrapped via
/// [`ApiError::internal`] at the boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(AuthErrorKind),

    #[error("node requires auth but has no trusted head keys")]
    TrustNotConfigured,

    #[error("node {node_id} unreachable: {detail}")]
    NodeUnreachable { node_id: String, detail: String },

    #[error("node {node_id} timed out")]
    NodeTimeout { node_id: String },

    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: String },
}

/// Why envelope verification failed. Each kind has its own surface code so
/// the head can tell a clock-skew problem from a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthErrorKind {
    #[error("signature headers missing or malformed")]
    MissingEnvelope,
    #[error("signing key is not trusted by this node")]
    UnknownKey,
    #[error("signature does not match the request")]
    BadSignature,
    #[error("envelope timestamp outside the accepted window")]
    Stale,
    #[error("envelope nonce was already used")]
    Replayed,
}

impl AuthErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingEnvelope => "missing_envelope",
            Self::UnknownKey => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::Stale => "stale",
            Self::Replayed => "replayed",
        }
    }
}

impl ApiError {
    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::InvalidInput(detail.into())
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict(detail.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Wrap an unexpected error. The cause is logged with a correlation id;
    /// the response carries only the id, never the underlying message.
    pub fn internal(source: anyhow::Error) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(%correlation_id, error = %format!("{source:#}"), "internal error");
        Self::Internal { correlation_id }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(kind) => kind.code(),
            Self::TrustNotConfigured => "trust_not_configured",
            Self::NodeUnreachable { .. } => "node_unreachable",
            Self::NodeTimeout { .. } => "node_unreachable",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::TrustNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::NodeUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::NodeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "detail": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

// ─── Terminal task reasons ───────────────────────────────────────────────────

/// Values stored in `last_error` when a run ends abnormally.
pub mod reason {
    pub const STEP_BUDGET_EXCEEDED: &str = "step_budget_exceeded";
    pub const NODE_RESTART: &str = "node_restart";
    pub const BROWSER_CRASHED: &str = "browser_crashed";
    pub const CANCELLED: &str = "cancelled";
}
