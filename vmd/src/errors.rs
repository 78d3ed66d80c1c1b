use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use validator::ValidationErrors;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("validation error in request body")]
    Validation(#[from] ValidationErrors),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Exhausted(String),

    #[error("host operation failed: {0}")]
    HostOp(String),

    #[error("failed to spawn vmm: {0}")]
    Spawn(String),

    #[error("vmm api error: {0}")]
    VmmApi(String),

    #[error("serial pipe error: {0}")]
    Pipe(String),

    #[error("an internal database error occurred")]
    Storage(#[from] sqlx::Error),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

impl Error {
    fn status_code(&self) -> StatusCode {
        use Error::*;

        match self {
            NotFound(_) => StatusCode::NOT_FOUND,
            Conflict(_) => StatusCode::CONFLICT,
            Validation(_) | InvalidState(_) => StatusCode::BAD_REQUEST,
            Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Exhausted(_) | HostOp(_) | Spawn(_) | VmmApi(_) | Pipe(_) | Storage(_)
            | Timeout(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        #[derive(serde::Serialize)]
        struct ErrorResponse {
            message: String,
        }

        tracing::error!(error = %self, "request failed");
        (
            self.status_code(),
            Json(ErrorResponse {
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}
