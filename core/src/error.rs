use thiserror::Error;

/// Failures surfaced by ledger operations.
///
/// `NotFound` is kept apart from empty results so callers can tell "no such tuple"
/// from "tuple exists but has nothing to show".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("no such record: {0}")]
    NotFound(String),
    #[error("socket table unavailable: {0}")]
    ScanUnavailable(String),
    #[error("store unavailable: {0}")]
    Store(String),
    #[error("diagnosis failed: {0}")]
    Diagnosis(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    /// Wraps a store-side failure, keeping the whole context chain in the message.
    pub fn store(err: impl std::fmt::Display) -> Self {
        LedgerError::Store(format!("{err:#}"))
    }

    /// Short machine-readable code, used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::ScanUnavailable(_) => "scan_unavailable",
            LedgerError::Store(_) => "store_unavailable",
            LedgerError::Diagnosis(_) => "diagnosis_failed",
        }
    }
}
