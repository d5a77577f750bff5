pub mod clock;
pub mod finalize;
pub mod holds;
pub mod inventory;
pub mod memory;
pub mod queue;
pub mod rate_limit;
pub mod reaper;
pub mod reconcile;
pub mod repository;
pub mod sweeper;

use turnstile_shared::HoldStatus;

/// Expected business outcomes. Surfaced to callers with enough detail to act on,
/// never logged as errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Invalid quantity for category {category_id}")]
    InvalidQuantity { category_id: String },
    #[error("Insufficient stock for category {category_id}: {available} available")]
    InsufficientStock { category_id: String, available: i64 },
    #[error("Hold already exists")]
    HoldAlreadyExists,
    #[error("Hold token does not match")]
    InvalidToken,
    #[error("Hold is not active (status: {status})")]
    HoldNotActive { status: HoldStatus },
    #[error("Hold has not been claimed (status: {status})")]
    HoldNotClaimed { status: HoldStatus },
    #[error("Queue entry at position {position} is not ready yet")]
    NotReady { position: u64, retry_after_seconds: u64 },
    #[error("Claim token does not match queue entry")]
    InvalidClaimToken,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Rejection::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Rejection::HoldAlreadyExists => "HOLD_ALREADY_EXISTS",
            Rejection::InvalidToken => "INVALID_TOKEN",
            Rejection::HoldNotActive { .. } => "HOLD_NOT_ACTIVE",
            Rejection::HoldNotClaimed { .. } => "HOLD_NOT_CLAIMED",
            Rejection::NotReady { .. } => "NOT_READY",
            Rejection::InvalidClaimToken => "INVALID_CLAIM_TOKEN",
        }
    }
}

/// Terminal for the token in question: the caller has to restart the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotFoundKind {
    #[error("Hold not found or expired")]
    Hold,
    #[error("Queue entry expired")]
    QueueExpired,
    #[error("Not in queue")]
    NotInQueue,
}

impl NotFoundKind {
    pub fn code(&self) -> &'static str {
        match self {
            NotFoundKind::Hold => "HOLD_NOT_FOUND",
            NotFoundKind::QueueExpired => "QUEUE_EXPIRED",
            NotFoundKind::NotInQueue => "NOT_IN_QUEUE",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Rejected: {0}")]
    Rejected(Rejection),
    #[error("Not found: {0}")]
    NotFound(NotFoundKind),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Ledger error: {0}")]
    LedgerError(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ValidationError(_) => "VALIDATION_ERROR",
            CoreError::Rejected(r) => r.code(),
            CoreError::NotFound(k) => k.code(),
            CoreError::StoreError(_) => "REDIS_ERROR",
            CoreError::LedgerError(_) => "LEDGER_ERROR",
        }
    }

    /// Store and ledger failures; everything else is an expected outcome.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, CoreError::StoreError(_) | CoreError::LedgerError(_))
    }
}

impl From<Rejection> for CoreError {
    fn from(r: Rejection) -> Self {
        CoreError::Rejected(r)
    }
}

impl From<NotFoundKind> for CoreError {
    fn from(k: NotFoundKind) -> Self {
        CoreError::NotFound(k)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err: CoreError = Rejection::InsufficientStock {
            category_id: "cat-001-1".into(),
            available: 0,
        }
        .into();
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");
        assert!(!err.is_infrastructure());

        assert_eq!(CoreError::from(NotFoundKind::Hold).code(), "HOLD_NOT_FOUND");
        assert_eq!(CoreError::StoreError("down".into()).code(), "REDIS_ERROR");
        assert!(CoreError::LedgerError("tx".into()).is_infrastructure());
    }
}
