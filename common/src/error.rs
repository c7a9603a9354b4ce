//! Error types for bankcore operations.

use crate::{AccountId, AlertId, Currency, RequestId, RequestStatus, RiskAssessment, UserId};
use serde::Serialize;
use thiserror::Error;

/// Main error type for bankcore operations.
#[derive(Error, Debug)]
pub enum BankError {
    /// Malformed input, rejected before touching storage.
    #[error("Invalid input: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// No account carries the given routing reference.
    #[error("Destination account not found: {0}")]
    DestinationNotFound(String),

    /// Transfer request does not exist.
    #[error("Transfer request not found: {0}")]
    RequestNotFound(RequestId),

    /// Fraud alert does not exist.
    #[error("Fraud alert not found: {0}")]
    AlertNotFound(AlertId),

    /// The acting user does not own the resource.
    #[error("User {user} is not allowed to {action}")]
    Forbidden { user: UserId, action: String },

    /// Balance too low for the requested debit.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    /// The risk gate vetoed the transfer.
    #[error("Transfer blocked by risk gate: score {:.3}, {}", .0.assessment.risk_score, .0.assessment.reason)]
    RiskBlocked(Box<RiskBlock>),

    /// Transfer request already left the Pending state.
    #[error("Transfer request {id} already processed ({status})")]
    AlreadyProcessed { id: RequestId, status: RequestStatus },

    /// Invalid request state transition.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Source and destination currencies differ.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Risk scorer unreachable or answered garbage. Recovered by the gate's
    /// local fallback; never returned to callers of the engine.
    #[error("External service degraded: {0}")]
    ExternalServiceDegraded(String),

    /// Storage failure. The enclosing unit is always rolled back.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Risk metadata attached to a blocked transfer.
#[derive(Debug, Clone, Serialize)]
pub struct RiskBlock {
    /// The gate's verdict.
    pub assessment: RiskAssessment,
    /// Threshold the verdict was compared against.
    pub threshold: f64,
    /// Alert persisted for the block, when the sink accepted it.
    pub alert_id: Option<AlertId>,
}

/// Caller-facing outcome classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    InsufficientFunds,
    Blocked,
    AlreadyProcessed,
    ServerError,
}

impl BankError {
    /// Shorthand for an ownership failure.
    pub fn forbidden(user: UserId, action: impl Into<String>) -> Self {
        BankError::Forbidden {
            user,
            action: action.into(),
        }
    }

    /// Shorthand for a storage failure.
    pub fn storage(error: impl std::fmt::Display) -> Self {
        BankError::Storage(error.to_string())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankError::Storage(_) | BankError::ExternalServiceDegraded(_)
        )
    }

    /// Classify for the caller-facing contract.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BankError::Validation { .. }
            | BankError::InvalidTransition { .. }
            | BankError::CurrencyMismatch { .. } => ErrorKind::Validation,
            BankError::AccountNotFound(_)
            | BankError::DestinationNotFound(_)
            | BankError::RequestNotFound(_)
            | BankError::AlertNotFound(_) => ErrorKind::NotFound,
            BankError::Forbidden { .. } => ErrorKind::Forbidden,
            BankError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            BankError::RiskBlocked(_) => ErrorKind::Blocked,
            BankError::AlreadyProcessed { .. } => ErrorKind::AlreadyProcessed,
            BankError::ExternalServiceDegraded(_)
            | BankError::Storage(_)
            | BankError::Configuration(_)
            | BankError::Internal(_) => ErrorKind::ServerError,
        }
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            BankError::Validation { .. } => "VALIDATION_ERROR",
            BankError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            BankError::DestinationNotFound(_) => "DESTINATION_NOT_FOUND",
            BankError::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            BankError::AlertNotFound(_) => "ALERT_NOT_FOUND",
            BankError::Forbidden { .. } => "FORBIDDEN",
            BankError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            BankError::RiskBlocked(_) => "RISK_BLOCKED",
            BankError::AlreadyProcessed { .. } => "ALREADY_PROCESSED",
            BankError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BankError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            BankError::ExternalServiceDegraded(_) => "EXTERNAL_SERVICE_DEGRADED",
            BankError::Storage(_) => "STORAGE_ERROR",
            BankError::Configuration(_) => "CONFIGURATION_ERROR",
            BankError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Risk metadata if this is a risk block.
    pub fn risk_block(&self) -> Option<&RiskBlock> {
        match self {
            BankError::RiskBlocked(block) => Some(block),
            _ => None,
        }
    }
}

/// Result type alias for bankcore operations.
pub type Result<T> = std::result::Result<T, BankError>;

/// Serializable error body for the caller-facing surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskBlock>,
}

impl From<&BankError> for ErrorBody {
    fn from(error: &BankError) -> Self {
        Self {
            code: error.error_code(),
            kind: error.kind(),
            message: error.to_string(),
            risk: error.risk_block().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            BankError::AccountNotFound(AccountId::new(1)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            BankError::forbidden(UserId::new(2), "debit account 1").kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(BankError::storage("boom").kind(), ErrorKind::ServerError);
        assert_eq!(
            BankError::ExternalServiceDegraded("timeout".into()).kind(),
            ErrorKind::ServerError
        );
    }

    #[test]
    fn test_error_body_carries_risk_metadata() {
        let error = BankError::RiskBlocked(Box::new(RiskBlock {
            assessment: RiskAssessment {
                risk_score: 0.92,
                is_fraud: true,
                reason: "Very large transaction amount".to_string(),
                confidence: 0.7,
                fallback: false,
                features: None,
            },
            threshold: 0.85,
            alert_id: Some(AlertId::new(3)),
        }));

        let body = ErrorBody::from(&error);
        assert_eq!(body.code, "RISK_BLOCKED");
        assert_eq!(body.kind, ErrorKind::Blocked);
        assert_eq!(body.risk.unwrap().alert_id, Some(AlertId::new(3)));
        assert!(error.to_string().contains("0.920"));
    }

    #[test]
    fn test_retryable() {
        assert!(BankError::storage("connection reset").is_retryable());
        assert!(!BankError::RequestNotFound(RequestId::new(1)).is_retryable());
    }
}
