use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid or missing credentials")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("requested {requested} seats but only {available} available")]
    SeatsUnavailable { requested: i64, available: i64 },

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("store did not respond in time")]
    StoreTimeout,

    #[error("password hashing error: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),
}

pub type AppResult<T> = Result<T, AppError>;

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6). Extended result codes keep the
/// primary code in the low byte.
fn is_lock_contention(code: i32) -> bool {
    matches!(code & 0xff, 5 | 6)
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    /// Failures worth another attempt on a read: lock contention, pool
    /// exhaustion, I/O, attempt timeout.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::StoreTimeout => true,
            AppError::Persistence(sqlx::Error::Io(_)) => true,
            _ => self.is_safe_to_replay(),
        }
    }

    /// Failures after which a write is known not to have committed.
    pub fn is_safe_to_replay(&self) -> bool {
        match self {
            AppError::Persistence(sqlx::Error::PoolTimedOut) => true,
            AppError::Persistence(sqlx::Error::Database(db_err)) => db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .is_some_and(is_lock_contention),
            _ => false,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) | AppError::SeatsUnavailable { .. } => StatusCode::CONFLICT,
            AppError::StoreTimeout => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Persistence(_) | AppError::PasswordHash(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(ErrorResponse { error })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seats_unavailable_maps_to_conflict() {
        let err = AppError::SeatsUnavailable {
            requested: 2,
            available: 1,
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "requested 2 seats but only 1 available");
    }

    #[test]
    fn transient_classification() {
        assert!(AppError::StoreTimeout.is_transient());
        assert!(AppError::Persistence(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!AppError::Persistence(sqlx::Error::RowNotFound).is_transient());
        assert!(!AppError::validation("bad").is_transient());
    }

    #[test]
    fn timeouts_are_not_replayed_as_writes() {
        assert!(!AppError::StoreTimeout.is_safe_to_replay());
        assert!(AppError::Persistence(sqlx::Error::PoolTimedOut).is_safe_to_replay());
    }

    #[test]
    fn lock_contention_masks_extended_codes() {
        assert!(is_lock_contention(5));
        assert!(is_lock_contention(6));
        // SQLITE_BUSY_SNAPSHOT, SQLITE_LOCKED_SHAREDCACHE
        assert!(is_lock_contention(517));
        assert!(is_lock_contention(262));
        // SQLITE_CONSTRAINT_UNIQUE
        assert!(!is_lock_contention(2067));
    }

    #[tokio::test]
    async fn busy_database_is_retryable() {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::{Connection, SqliteConnection};
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("busy.db"))
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO);

        let mut holder = SqliteConnection::connect_with(&options).await.unwrap();
        let mut contender = SqliteConnection::connect_with(&options).await.unwrap();

        let mut tx = holder.begin().await.unwrap();
        sqlx::query("CREATE TABLE held (id INTEGER)")
            .execute(&mut *tx)
            .await
            .unwrap();

        let err = AppError::from(
            sqlx::query("CREATE TABLE blocked (id INTEGER)")
                .execute(&mut contender)
                .await
                .unwrap_err(),
        );
        assert!(err.is_safe_to_replay(), "expected lock contention, got {err}");
        assert!(err.is_transient());

        tx.rollback().await.unwrap();
    }

    #[test]
    fn not_found_message_names_entity() {
        assert_eq!(AppError::NotFound("ride").to_string(), "ride not found");
        assert_eq!(AppError::NotFound("ride").status(), StatusCode::NOT_FOUND);
    }
}
