use thiserror::Error;

/// Result type alias used across the ledger core
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger-core errors
///
/// Validation and ownership failures are detected before any database
/// mutation; `Constraint` and `Transaction` are surfaced by the store
/// after an aborted unit and are never retried automatically.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Bad or missing input, e.g. a non-positive amount
    #[error("Validation error: {0}")]
    Validation(String),

    /// Candidate or gateway transaction absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ownership violation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unique-key collision, e.g. a duplicate tran_id or passport number
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Atomic unit aborted for any other storage reason
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Network failure or non-success response from the payment gateway
    #[error("Gateway error: {0}")]
    Gateway(String),
}

impl LedgerError {
    /// Message safe to place on an external redirect; raw storage and
    /// network details never leave the process this way.
    pub fn user_message(&self) -> &str {
        match self {
            LedgerError::Validation(_) => "Invalid payment details.",
            LedgerError::NotFound(_) => "Record not found.",
            LedgerError::Forbidden(_) => "You do not have access to this record.",
            LedgerError::Constraint(_) => "Duplicate record.",
            LedgerError::Transaction(_) => "Database Update Failed",
            LedgerError::Gateway(_) => "Payment gateway unavailable. Please try again.",
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LedgerError::Constraint(
                    msg.unwrap_or_else(|| "unique constraint violated".to_string()),
                )
            }
            other => LedgerError::Transaction(other.to_string()),
        }
    }
}
