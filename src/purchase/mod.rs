//! Purchase orchestration: reserve a fraction, debit the investor, commit
//! or compensate.

pub mod orchestrator;

pub use orchestrator::*;

use serde::{Deserialize, Serialize};

use crate::ledger::ownership::OwnershipError;
use crate::ledger::wallet::WalletError;
use crate::money::{Money, MoneyError, Percentage};
use crate::types::{AssetStatus, LedgerError};

/// A purchase request as submitted by the investor-facing client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub asset_id: String,
    pub investor_id: String,
    pub amount: Money,
    /// Caller-supplied key; retries with the same key never buy twice
    pub idempotency_key: String,
}

impl PurchaseRequest {
    pub fn new(asset_id: &str, investor_id: &str, amount: Money, idempotency_key: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            investor_id: investor_id.to_string(),
            amount,
            idempotency_key: idempotency_key.to_string(),
        }
    }
}

/// How a caller should treat a purchase failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any mutation; retry after correcting the input
    Validation,
    /// Rejected after reservation; the reservation has been rolled back
    Resource,
    /// The idempotency key was reused with different parameters
    Conflict,
    /// Storage failure or a rollback that has not completed yet
    Internal,
}

/// Errors returned by [`PurchaseOrchestrator::purchase`]
#[derive(Debug, thiserror::Error)]
pub enum PurchaseError {
    #[error("Investment {amount} is below the minimum {minimum} for asset {asset_id}")]
    BelowMinInvestment {
        asset_id: String,
        amount: Money,
        minimum: Money,
    },
    #[error("Requested {requested_bps} bps exceeds remaining ownership {remaining} of asset {asset_id}")]
    Overallocated {
        asset_id: String,
        /// Exact share of the asset value asked for; may exceed 10,000
        requested_bps: i64,
        remaining: Percentage,
    },
    #[error("Insufficient funds in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        wallet_id: String,
        balance: Money,
        requested: Money,
    },
    #[error("Asset {asset_id} is not available for purchase (status: {status:?})")]
    AssetUnavailable { asset_id: String, status: AssetStatus },
    #[error("Wallet {0} is suspended")]
    WalletSuspended(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Asset not found: {0}")]
    AssetNotFound(String),
    #[error("Invalid purchase request: {0}")]
    InvalidRequest(String),
    #[error("Idempotency key '{0}' was already used for a different purchase")]
    IdempotencyConflict(String),
    #[error("Rollback of purchase {purchase_id} did not complete: {reason}")]
    CompensationFailed { purchase_id: String, reason: String },
    #[error(transparent)]
    Ledger(LedgerError),
}

impl PurchaseError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PurchaseError::BelowMinInvestment { .. }
            | PurchaseError::Overallocated { .. }
            | PurchaseError::WalletNotFound(_)
            | PurchaseError::AssetNotFound(_)
            | PurchaseError::InvalidRequest(_) => ErrorCategory::Validation,
            PurchaseError::InsufficientFunds { .. }
            | PurchaseError::AssetUnavailable { .. }
            | PurchaseError::WalletSuspended(_) => ErrorCategory::Resource,
            PurchaseError::IdempotencyConflict(_) => ErrorCategory::Conflict,
            PurchaseError::CompensationFailed { .. } | PurchaseError::Ledger(_) => {
                ErrorCategory::Internal
            }
        }
    }
}

impl From<LedgerError> for PurchaseError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AssetNotFound(id) => PurchaseError::AssetNotFound(id),
            LedgerError::WalletNotFound(id) => PurchaseError::WalletNotFound(id),
            LedgerError::Validation(message) => PurchaseError::InvalidRequest(message),
            other => PurchaseError::Ledger(other),
        }
    }
}

impl From<MoneyError> for PurchaseError {
    fn from(err: MoneyError) -> Self {
        PurchaseError::Ledger(LedgerError::Money(err))
    }
}

impl From<OwnershipError> for PurchaseError {
    fn from(err: OwnershipError) -> Self {
        match err {
            OwnershipError::Overallocated {
                asset_id,
                requested,
                remaining,
            } => PurchaseError::Overallocated {
                asset_id,
                requested_bps: i64::from(requested.bps()),
                remaining,
            },
            OwnershipError::AssetUnavailable { asset_id, status } => {
                PurchaseError::AssetUnavailable { asset_id, status }
            }
            OwnershipError::BelowMinInvestment {
                asset_id,
                amount,
                minimum,
            } => PurchaseError::BelowMinInvestment {
                asset_id,
                amount,
                minimum,
            },
            OwnershipError::InvalidFraction(message) => PurchaseError::InvalidRequest(message),
            OwnershipError::Ledger(err) => err.into(),
        }
    }
}

impl From<WalletError> for PurchaseError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds {
                wallet_id,
                balance,
                requested,
            } => PurchaseError::InsufficientFunds {
                wallet_id,
                balance,
                requested,
            },
            WalletError::WalletSuspended(id) => PurchaseError::WalletSuspended(id),
            WalletError::WalletNotFound(id) => PurchaseError::WalletNotFound(id),
            WalletError::Ledger(err) => err.into(),
            other @ WalletError::TransferStranded { .. } => {
                PurchaseError::Ledger(LedgerError::InvariantViolation(other.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let below = PurchaseError::BelowMinInvestment {
            asset_id: "keke-01".to_string(),
            amount: Money::from_major(500).unwrap(),
            minimum: Money::from_major(1_000).unwrap(),
        };
        assert_eq!(below.category(), ErrorCategory::Validation);

        let funds: PurchaseError = WalletError::InsufficientFunds {
            wallet_id: "w-1".to_string(),
            balance: Money::ZERO,
            requested: Money::from_major(10).unwrap(),
        }
        .into();
        assert_eq!(funds.category(), ErrorCategory::Resource);

        let missing: PurchaseError = OwnershipError::Ledger(LedgerError::AssetNotFound("x".to_string())).into();
        assert!(matches!(missing, PurchaseError::AssetNotFound(_)));

        let storage: PurchaseError = LedgerError::Storage("disk".to_string()).into();
        assert_eq!(storage.category(), ErrorCategory::Internal);
    }
}
