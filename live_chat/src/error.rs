use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chat_protocol::ErrorBody;
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Errors surfaced by the directory, ledger, accounts and session layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("{field} already exists")]
    Conflict { field: &'static str },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ChatError::InvalidRequest(msg.into())
    }

    /// Message shown to a socket client. Missing conversations and missing
    /// membership read the same.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::InvalidRequest(msg) => msg.clone(),
            ChatError::Unauthenticated => "Not authenticated".into(),
            ChatError::Unauthorized | ChatError::NotFound => "Unauthorized or chat not found".into(),
            ChatError::Conflict { field } => format!("{} already exists", field),
            ChatError::Internal(_) => "Internal server error".into(),
        }
    }
}

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("sender is not a participant")]
    NotParticipant,

    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ChatError::NotFound,
            StoreError::NotParticipant => ChatError::Unauthorized,
            StoreError::Duplicate(field) => ChatError::Conflict { field },
            other => ChatError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ChatError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "invalid_request".into(),
                    message: Some(msg.clone()),
                    field: None,
                },
            ),
            ChatError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "unauthenticated".into(),
                    message: None,
                    field: None,
                },
            ),
            ChatError::Unauthorized | ChatError::NotFound => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: "chat_not_found_or_unauthorized".into(),
                    message: None,
                    field: None,
                },
            ),
            ChatError::Conflict { field } => (
                StatusCode::CONFLICT,
                ErrorBody {
                    error: "conflict".into(),
                    message: Some(format!("{} already exists", field)),
                    field: Some((*field).into()),
                },
            ),
            ChatError::Internal(detail) => {
                tracing::error!(%detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "internal".into(),
                        message: None,
                        field: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_classify() {
        assert_eq!(ChatError::from(StoreError::NotFound), ChatError::NotFound);
        assert_eq!(
            ChatError::from(StoreError::NotParticipant),
            ChatError::Unauthorized
        );
        assert_eq!(
            ChatError::from(StoreError::Duplicate("email")),
            ChatError::Conflict { field: "email" }
        );
        assert!(matches!(
            ChatError::from(StoreError::Corrupt("x".into())),
            ChatError::Internal(_)
        ));
    }

    #[test]
    fn denial_statuses_are_merged() {
        let a = ChatError::NotFound.into_response();
        let b = ChatError::Unauthorized.into_response();
        assert_eq!(a.status(), StatusCode::NOT_FOUND);
        assert_eq!(a.status(), b.status());
        assert_eq!(
            ChatError::NotFound.client_message(),
            ChatError::Unauthorized.client_message()
        );
    }
}
