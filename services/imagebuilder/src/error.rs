use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Failures of the job store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the job API.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ─────────────────────────────────────────────────────────────────────
    // Client errors
    // ─────────────────────────────────────────────────────────────────────
    /// Every validation complaint, in the order they were found.
    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotReady(String),

    // ─────────────────────────────────────────────────────────────────────
    // Server errors
    // ─────────────────────────────────────────────────────────────────────
    #[error(transparent)]
    Store(StoreError),

    #[error("artifact storage: {0}")]
    Artifact(#[from] std::io::Error),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyExists { .. } => ServiceError::Conflict(e.to_string()),
            other => ServiceError::Store(other),
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) | ServiceError::NotReady(_) => StatusCode::CONFLICT,
            ServiceError::Store(_) | ServiceError::Artifact(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "BadRequest",
            ServiceError::NotFound { .. } => "NotFound",
            ServiceError::Conflict(_) => "AlreadyExists",
            ServiceError::NotReady(_) => "Conflict",
            ServiceError::Store(_) | ServiceError::Artifact(_) => "InternalError",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = serde_json::json!({
            "code": status.as_u16(),
            "reason": self.reason(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_joins_every_message() {
        let e = ServiceError::Validation(vec![
            "spec.source.imageTag is required".into(),
            "spec.destination.imageName: must match OCI repository name format".into(),
        ]);
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
        let msg = e.to_string();
        assert!(msg.contains("spec.source.imageTag is required"));
        assert!(msg.contains("spec.destination.imageName"));
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let e: ServiceError = StoreError::AlreadyExists {
            kind: "ImageBuild",
            name: "b1".into(),
        }
        .into();
        assert_eq!(e.status(), StatusCode::CONFLICT);
        assert_eq!(e.to_string(), "ImageBuild \"b1\" already exists");
    }
}
