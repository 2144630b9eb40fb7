//! Error types for the points core
//!
//! Every domain error carries a stable code and an HTTP status hint so the
//! transport layer can frame responses without inspecting variants.

use thiserror::Error;

/// Domain errors surfaced by the ledger, wallet engine, reservations, and
/// ingest pipeline.
#[derive(Error, Debug, Clone)]
pub enum PointsError {
    // === Validation Errors ===
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    // === Idempotency ===
    #[error("Duplicate request with divergent payload")]
    IdempotencyConflict {
        stored_result: serde_json::Value,
        status_code: u16,
    },

    // === Concurrency ===
    #[error("Optimistic lock conflict after retry exhaustion")]
    OptimisticLockConflict,

    // === Escrow ===
    #[error("Escrow not found: {0}")]
    EscrowNotFound(String),

    #[error("Escrow already processed: {0}")]
    EscrowAlreadyProcessed(String),

    // === Reservations ===
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    #[error("Reservation already processed: {0}")]
    ReservationAlreadyProcessed(String),

    #[error("Reservation expired: {0}")]
    ReservationExpired(String),

    // === Authorization ===
    #[error("Invalid authorization: {0}")]
    InvalidAuthorization(String),

    #[error("Forbidden: missing role {0}")]
    Forbidden(String),

    // === System Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PointsError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            PointsError::InvalidInput(_) => "INVALID_INPUT",
            PointsError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            PointsError::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            PointsError::OptimisticLockConflict => "OPTIMISTIC_LOCK_CONFLICT",
            PointsError::EscrowNotFound(_) => "ESCROW_NOT_FOUND",
            PointsError::EscrowAlreadyProcessed(_) => "ESCROW_ALREADY_PROCESSED",
            PointsError::ReservationNotFound(_) => "RESERVATION_NOT_FOUND",
            PointsError::ReservationAlreadyProcessed(_) => "RESERVATION_ALREADY_PROCESSED",
            PointsError::ReservationExpired(_) => "RESERVATION_EXPIRED",
            PointsError::InvalidAuthorization(_) => "INVALID_AUTHORIZATION",
            PointsError::Forbidden(_) => "FORBIDDEN",
            PointsError::Storage(_) => "STORAGE_ERROR",
            PointsError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status code suggestion.
    pub fn http_status(&self) -> u16 {
        match self {
            PointsError::InvalidInput(_) => 400,
            PointsError::InvalidAuthorization(_) => 401,
            PointsError::Forbidden(_) => 403,
            PointsError::EscrowNotFound(_) | PointsError::ReservationNotFound(_) => 404,
            PointsError::IdempotencyConflict { .. }
            | PointsError::OptimisticLockConflict
            | PointsError::EscrowAlreadyProcessed(_)
            | PointsError::ReservationAlreadyProcessed(_) => 409,
            PointsError::ReservationExpired(_) => 410,
            PointsError::InsufficientBalance => 422,
            PointsError::Storage(_) | PointsError::Internal(_) => 500,
        }
    }

    /// Whether a caller may safely retry with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PointsError::OptimisticLockConflict | PointsError::Storage(_)
        )
    }
}

impl From<sqlx::Error> for PointsError {
    fn from(e: sqlx::Error) -> Self {
        PointsError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for PointsError {
    fn from(e: anyhow::Error) -> Self {
        PointsError::Internal(e.to_string())
    }
}
