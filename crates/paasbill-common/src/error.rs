//! Error types for the billing engine
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;

/// Result type alias using BillingError
pub type Result<T> = std::result::Result<T, BillingError>;

/// Unified error type for billing operations
#[derive(Debug, Error)]
pub enum BillingError {
    // Input validation errors
    #[error("{0}")]
    Validation(#[from] ValidationError),

    // Reference data errors
    #[error("{0}")]
    Reference(#[from] ReferenceError),

    // Consolidation history already holds the range
    #[error("range already consolidated: {0}")]
    AlreadyConsolidated(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Remote platform API errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    // Caller stopped the operation
    #[error("Operation cancelled")]
    Cancelled,

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// True for errors caused by the caller's input rather than the system
    pub fn is_client_error(&self) -> bool {
        matches!(self, BillingError::Validation(_))
    }
}

/// Input validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("a valid {name} filter value is required - expected format YYYY-MM-DD or RFC 3339 - got '{value}'")]
    InvalidRangeValue { name: String, value: String },

    #[error("{0}")]
    InvalidRange(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("{0}")]
    Formula(#[from] FormulaError),
}

/// Pricing formula errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("illegal token in formula: {0}")]
    IllegalToken(String),

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("unbalanced parentheses in formula")]
    UnbalancedParens,

    #[error("invalid number in formula: {0}")]
    InvalidNumber(String),

    #[error("division by zero in formula")]
    DivisionByZero,

    #[error("formula evaluation overflow")]
    Overflow,
}

/// Reference data (plans, VAT, currency) errors
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("invalid {field}: {reason}")]
    InvalidReference { field: String, reason: String },

    #[error("missing '{resource_type}' pricing plan configuration for '{plan_name}' ({plan_guid})")]
    MissingPlan {
        plan_guid: String,
        plan_name: String,
        resource_type: String,
    },

    #[error("missing vat_rate for '{code}' for period '{valid_from}' required by plan '{plan_guid}'")]
    MissingVatRate {
        code: String,
        valid_from: String,
        plan_guid: String,
    },

    #[error("missing currency_rate for '{code}' for period '{valid_from}' required by plan '{plan_guid}'")]
    MissingCurrencyRate {
        code: String,
        valid_from: String,
        plan_guid: String,
    },
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BillingError {
    fn from(err: std::io::Error) -> Self {
        BillingError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for BillingError {
    fn from(err: anyhow::Error) -> Self {
        BillingError::Internal(err.to_string())
    }
}

impl From<FormulaError> for BillingError {
    fn from(err: FormulaError) -> Self {
        BillingError::Validation(ValidationError::Formula(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formula_error_display() {
        let err = BillingError::from(FormulaError::IllegalToken(";".to_string()));
        assert_eq!(err.to_string(), "illegal token in formula: ;");
        assert!(err.is_client_error());
    }

    #[test]
    fn test_missing_plan_display() {
        let err = ReferenceError::MissingPlan {
            plan_guid: "f4d4b95a-f55e-4593-8d54-3364c25798c4".to_string(),
            plan_name: "app".to_string(),
            resource_type: "app".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "missing 'app' pricing plan configuration for 'app' (f4d4b95a-f55e-4593-8d54-3364c25798c4)"
        );
    }

    #[test]
    fn test_storage_error_is_not_client_error() {
        let err = BillingError::Storage("disk full".to_string());
        assert!(!err.is_client_error());
    }
}
