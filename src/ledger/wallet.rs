//! Wallet ledger: per-owner balances backed by an append-only transaction log

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::locks::KeyedLocks;
use crate::money::{Money, MoneyError};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::{validate_identifier, validate_positive_amount, validate_reference};

/// Errors raised by wallet operations
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Insufficient funds in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        wallet_id: String,
        balance: Money,
        requested: Money,
    },
    #[error("Wallet {0} is suspended")]
    WalletSuspended(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    /// The outgoing leg was applied but neither the credit nor its refund was
    #[error(
        "Transfer {reference} of {amount} left wallet {from_wallet_id} debited: credit failed ({credit_error}), refund failed ({refund_error})"
    )]
    TransferStranded {
        reference: String,
        from_wallet_id: String,
        amount: Money,
        credit_error: String,
        refund_error: String,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<MoneyError> for WalletError {
    fn from(err: MoneyError) -> Self {
        WalletError::Ledger(LedgerError::Money(err))
    }
}

/// Comparison of a wallet's cached balance against its log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletReconciliation {
    pub wallet_id: String,
    pub cached_balance: Money,
    pub ledger_balance: Money,
    pub is_consistent: bool,
}

/// Both legs of a wallet-to-wallet transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub outgoing_transaction_id: String,
    pub incoming_transaction_id: String,
}

/// Balance computed from completed log entries only
pub fn ledger_balance(transactions: &[WalletTransaction]) -> Result<Money, MoneyError> {
    transactions
        .iter()
        .filter(|t| t.is_completed())
        .try_fold(Money::ZERO, |acc, t| acc.checked_add(t.signed_net_amount()?))
}

/// Wallet ledger with per-wallet serialization and reference idempotency
pub struct WalletLedger<S: LedgerStorage> {
    storage: S,
    locks: KeyedLocks,
}

impl<S: LedgerStorage> WalletLedger<S> {
    /// Create a new wallet ledger
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
        }
    }

    /// Open the wallet for an owner. Each owner has exactly one wallet.
    pub async fn open_wallet(&self, owner_id: &str) -> Result<Wallet, WalletError> {
        validate_identifier("Owner ID", owner_id)?;
        let _guard = self.locks.lock(&format!("owner:{}", owner_id)).await?;

        if self.storage.get_wallet_by_owner(owner_id).await?.is_some() {
            return Err(LedgerError::Duplicate(format!("wallet for owner '{}'", owner_id)).into());
        }

        let wallet = Wallet::new(owner_id);
        self.storage.save_wallet(&wallet).await?;
        info!(wallet_id = %wallet.id, owner_id, "wallet opened");
        Ok(wallet)
    }

    /// Get a wallet by ID, returning an error if not found
    pub async fn wallet(&self, wallet_id: &str) -> Result<Wallet, WalletError> {
        self.storage
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| WalletError::WalletNotFound(wallet_id.to_string()))
    }

    /// Get the wallet of an owner, returning an error if not found
    pub async fn wallet_for_owner(&self, owner_id: &str) -> Result<Wallet, WalletError> {
        self.storage
            .get_wallet_by_owner(owner_id)
            .await?
            .ok_or_else(|| WalletError::WalletNotFound(format!("owner '{}'", owner_id)))
    }

    /// Debit a wallet for an investment.
    ///
    /// Fails with `InsufficientFunds` without touching the balance when the
    /// wallet cannot cover `amount`. Idempotent on `reference`.
    pub async fn debit(
        &self,
        wallet_id: &str,
        amount: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        self.post(wallet_id, TransactionType::Investment, amount, Money::ZERO, reference)
            .await
    }

    /// Credit a payout to a wallet. Idempotent on `reference`.
    pub async fn credit(
        &self,
        wallet_id: &str,
        amount: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        self.post(wallet_id, TransactionType::Payout, amount, Money::ZERO, reference)
            .await
    }

    /// Record a deposit already verified by the payment gateway
    pub async fn record_deposit(
        &self,
        wallet_id: &str,
        amount: Money,
        fee: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        self.post(wallet_id, TransactionType::Deposit, amount, fee, reference)
            .await
    }

    /// Record a withdrawal already verified by the payment gateway
    pub async fn record_withdrawal(
        &self,
        wallet_id: &str,
        amount: Money,
        fee: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        self.post(wallet_id, TransactionType::Withdrawal, amount, fee, reference)
            .await
    }

    /// Move funds between two wallets.
    ///
    /// The outgoing leg is applied first; if the incoming leg fails the
    /// outgoing leg is refunded before the error is returned.
    pub async fn transfer(
        &self,
        from_wallet_id: &str,
        to_wallet_id: &str,
        amount: Money,
        reference: &str,
    ) -> Result<TransferReceipt, WalletError> {
        if from_wallet_id == to_wallet_id {
            return Err(LedgerError::Validation(
                "Cannot transfer to the same wallet".to_string(),
            )
            .into());
        }

        let outgoing = self
            .post(
                from_wallet_id,
                TransactionType::TransferOut,
                amount,
                Money::ZERO,
                &format!("{}:out", reference),
            )
            .await?;

        match self
            .post(
                to_wallet_id,
                TransactionType::TransferIn,
                amount,
                Money::ZERO,
                &format!("{}:in", reference),
            )
            .await
        {
            Ok(incoming) => Ok(TransferReceipt {
                outgoing_transaction_id: outgoing,
                incoming_transaction_id: incoming,
            }),
            Err(err) => {
                warn!(from_wallet_id, to_wallet_id, error = %err, "transfer credit failed, refunding");
                if let Err(refund_err) = self
                    .post(
                        from_wallet_id,
                        TransactionType::TransferIn,
                        amount,
                        Money::ZERO,
                        &format!("{}:refund", reference),
                    )
                    .await
                {
                    error!(
                        from_wallet_id,
                        to_wallet_id,
                        reference,
                        %amount,
                        credit_error = %err,
                        refund_error = %refund_err,
                        "transfer stranded: outgoing leg applied without credit or refund"
                    );
                    return Err(WalletError::TransferStranded {
                        reference: reference.to_string(),
                        from_wallet_id: from_wallet_id.to_string(),
                        amount,
                        credit_error: err.to_string(),
                        refund_error: refund_err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    /// Current balance, computed from the completed transaction log
    pub async fn balance_of(&self, wallet_id: &str) -> Result<Money, WalletError> {
        self.wallet(wallet_id).await?;
        let transactions = self.storage.list_wallet_transactions(wallet_id).await?;
        Ok(ledger_balance(&transactions)?)
    }

    /// Full transaction log of a wallet
    pub async fn transactions(&self, wallet_id: &str) -> Result<Vec<WalletTransaction>, WalletError> {
        self.wallet(wallet_id).await?;
        Ok(self.storage.list_wallet_transactions(wallet_id).await?)
    }

    /// Completed transaction for `reference`, if the wallet has one
    pub async fn completed_transaction(
        &self,
        wallet_id: &str,
        reference: &str,
    ) -> Result<Option<WalletTransaction>, WalletError> {
        Ok(self
            .storage
            .find_wallet_transaction(wallet_id, reference)
            .await?
            .filter(|t| t.is_completed()))
    }

    /// Compare the cached balance against the transaction log
    pub async fn reconcile(&self, wallet_id: &str) -> Result<WalletReconciliation, WalletError> {
        let _guard = self.locks.lock(wallet_id).await?;
        let wallet = self.wallet(wallet_id).await?;
        let transactions = self.storage.list_wallet_transactions(wallet_id).await?;
        let ledger_balance = ledger_balance(&transactions)?;

        Ok(WalletReconciliation {
            wallet_id: wallet.id,
            cached_balance: wallet.balance,
            ledger_balance,
            is_consistent: wallet.balance == ledger_balance,
        })
    }

    /// Block all further debits and credits
    pub async fn suspend_wallet(&self, wallet_id: &str) -> Result<Wallet, WalletError> {
        self.set_status(wallet_id, WalletStatus::Suspended).await
    }

    /// Lift a suspension
    pub async fn activate_wallet(&self, wallet_id: &str) -> Result<Wallet, WalletError> {
        self.set_status(wallet_id, WalletStatus::Active).await
    }

    async fn set_status(&self, wallet_id: &str, status: WalletStatus) -> Result<Wallet, WalletError> {
        let _guard = self.locks.lock(wallet_id).await?;
        let mut wallet = self.wallet(wallet_id).await?;
        wallet.status = status;
        wallet.updated_at = now();
        self.storage.update_wallet(&wallet).await?;
        info!(wallet_id, ?status, "wallet status changed");
        Ok(wallet)
    }

    /// The single debit/credit primitive.
    ///
    /// Appends exactly one transaction per executed call, moving it from
    /// `pending` to `completed` or `failed`. A reference whose latest attempt
    /// completed is answered from the log without re-executing.
    async fn post(
        &self,
        wallet_id: &str,
        kind: TransactionType,
        amount: Money,
        fee: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        validate_positive_amount(amount)?;
        validate_reference(reference)?;
        if fee.is_negative() {
            return Err(LedgerError::Validation("Fee cannot be negative".to_string()).into());
        }
        let net_amount = if kind.is_credit() {
            amount.checked_sub(fee)?
        } else {
            amount.checked_add(fee)?
        };
        if !net_amount.is_positive() {
            return Err(LedgerError::Validation(format!(
                "Fee {} consumes the whole amount {}",
                fee, amount
            ))
            .into());
        }

        let _guard = self.locks.lock(wallet_id).await?;

        if let Some(mut previous) = self
            .storage
            .find_wallet_transaction(wallet_id, reference)
            .await?
        {
            match previous.status {
                TransactionStatus::Completed => {
                    if previous.transaction_type != kind || previous.amount != amount {
                        return Err(LedgerError::Validation(format!(
                            "Reference '{}' was already used for a different transaction",
                            reference
                        ))
                        .into());
                    }
                    debug!(wallet_id, reference, "replayed completed wallet transaction");
                    return Ok(previous.id);
                }
                TransactionStatus::Pending => {
                    // Never applied: the balance is derived from completed entries only.
                    previous.fail("abandoned before completion");
                    self.storage.update_wallet_transaction(&previous).await?;
                }
                TransactionStatus::Failed => {}
            }
        }

        let mut wallet = self.wallet(wallet_id).await?;
        let mut transaction =
            WalletTransaction::pending(wallet_id, kind, amount, fee, net_amount, reference);
        self.storage.save_wallet_transaction(&transaction).await?;

        if !wallet.is_active() {
            transaction.fail("wallet suspended");
            self.storage.update_wallet_transaction(&transaction).await?;
            warn!(wallet_id, reference, ?kind, "wallet transaction rejected: wallet suspended");
            return Err(WalletError::WalletSuspended(wallet_id.to_string()));
        }

        let log = self.storage.list_wallet_transactions(wallet_id).await?;
        let balance = ledger_balance(&log)?;
        let new_balance = if kind.is_credit() {
            balance.checked_add(net_amount)?
        } else {
            balance.checked_sub(net_amount)?
        };

        if new_balance.is_negative() {
            transaction.fail("insufficient funds");
            self.storage.update_wallet_transaction(&transaction).await?;
            warn!(wallet_id, reference, %balance, requested = %net_amount, "wallet debit rejected: insufficient funds");
            return Err(WalletError::InsufficientFunds {
                wallet_id: wallet_id.to_string(),
                balance,
                requested: net_amount,
            });
        }

        transaction.complete();
        self.storage.update_wallet_transaction(&transaction).await?;

        wallet.balance = new_balance;
        wallet.updated_at = now();
        self.storage.update_wallet(&wallet).await?;

        info!(
            wallet_id,
            transaction_id = %transaction.id,
            reference,
            ?kind,
            amount = %net_amount,
            balance = %new_balance,
            "wallet transaction completed"
        );
        Ok(transaction.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_storage::MemoryStorage;

    async fn funded_wallet(ledger: &WalletLedger<MemoryStorage>, owner: &str, major: i64) -> Wallet {
        let wallet = ledger.open_wallet(owner).await.unwrap();
        ledger
            .record_deposit(
                &wallet.id,
                Money::from_major(major).unwrap(),
                Money::ZERO,
                &format!("seed-{}", owner),
            )
            .await
            .unwrap();
        wallet
    }

    #[tokio::test]
    async fn test_debit_and_credit() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let wallet = funded_wallet(&ledger, "investor-1", 1_000).await;

        ledger
            .debit(&wallet.id, Money::from_major(400).unwrap(), "buy-1")
            .await
            .unwrap();
        ledger
            .credit(&wallet.id, Money::from_major(50).unwrap(), "payout-1")
            .await
            .unwrap();

        assert_eq!(
            ledger.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(650).unwrap()
        );
        let reconciliation = ledger.reconcile(&wallet.id).await.unwrap();
        assert!(reconciliation.is_consistent);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balance_and_logs_failure() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let wallet = funded_wallet(&ledger, "investor-1", 100).await;

        let err = ledger
            .debit(&wallet.id, Money::from_major(101).unwrap(), "buy-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));

        assert_eq!(
            ledger.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(100).unwrap()
        );
        let log = ledger.transactions(&wallet.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_replayed_reference_is_not_applied_twice() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let wallet = funded_wallet(&ledger, "investor-1", 1_000).await;

        let first = ledger
            .debit(&wallet.id, Money::from_major(300).unwrap(), "buy-1")
            .await
            .unwrap();
        let second = ledger
            .debit(&wallet.id, Money::from_major(300).unwrap(), "buy-1")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(
            ledger.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(700).unwrap()
        );

        let conflicting = ledger
            .debit(&wallet.id, Money::from_major(1).unwrap(), "buy-1")
            .await;
        assert!(conflicting.is_err());
    }

    #[tokio::test]
    async fn test_suspended_wallet_rejects_credit_then_retry_succeeds() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let wallet = ledger.open_wallet("rider-1").await.unwrap();

        ledger.suspend_wallet(&wallet.id).await.unwrap();
        let err = ledger
            .credit(&wallet.id, Money::from_major(10).unwrap(), "payout-9")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::WalletSuspended(_)));

        ledger.activate_wallet(&wallet.id).await.unwrap();
        ledger
            .credit(&wallet.id, Money::from_major(10).unwrap(), "payout-9")
            .await
            .unwrap();

        let log = ledger.transactions(&wallet.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, TransactionStatus::Failed);
        assert_eq!(log[1].status, TransactionStatus::Completed);
        assert_eq!(
            ledger.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(10).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fees_on_gateway_movements() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let wallet = ledger.open_wallet("investor-1").await.unwrap();

        ledger
            .record_deposit(
                &wallet.id,
                Money::from_major(1_000).unwrap(),
                Money::from_major(15).unwrap(),
                "dep-1",
            )
            .await
            .unwrap();
        ledger
            .record_withdrawal(
                &wallet.id,
                Money::from_major(500).unwrap(),
                Money::from_major(10).unwrap(),
                "wd-1",
            )
            .await
            .unwrap();

        assert_eq!(
            ledger.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(475).unwrap()
        );
    }

    #[tokio::test]
    async fn test_transfer_refunds_when_destination_suspended() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let from = funded_wallet(&ledger, "investor-1", 200).await;
        let to = ledger.open_wallet("investor-2").await.unwrap();
        ledger.suspend_wallet(&to.id).await.unwrap();

        let err = ledger
            .transfer(&from.id, &to.id, Money::from_major(50).unwrap(), "tx-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::WalletSuspended(_)));
        assert_eq!(
            ledger.balance_of(&from.id).await.unwrap(),
            Money::from_major(200).unwrap()
        );

        ledger.activate_wallet(&to.id).await.unwrap();
        let receipt = ledger
            .transfer(&from.id, &to.id, Money::from_major(50).unwrap(), "tx-2")
            .await
            .unwrap();
        assert_ne!(receipt.outgoing_transaction_id, receipt.incoming_transaction_id);
        assert_eq!(
            ledger.balance_of(&to.id).await.unwrap(),
            Money::from_major(50).unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let ledger = std::sync::Arc::new(WalletLedger::new(MemoryStorage::new()));
        let wallet = funded_wallet(&ledger, "investor-1", 1_000).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = ledger.clone();
            let wallet_id = wallet.id.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .debit(&wallet_id, Money::from_major(100).unwrap(), &format!("buy-{}", i))
                    .await
                    .is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 10);
        assert_eq!(ledger.balance_of(&wallet.id).await.unwrap(), Money::ZERO);
        assert!(ledger.reconcile(&wallet.id).await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_failed_refund_reports_stranded_transfer() {
        let ledger = WalletLedger::new(MemoryStorage::new());
        let from = ledger.open_wallet("investor-1").await.unwrap();
        // The refund reference is already taken by a different entry
        ledger
            .record_deposit(&from.id, Money::from_major(200).unwrap(), Money::ZERO, "tx-1:refund")
            .await
            .unwrap();
        let to = ledger.open_wallet("investor-2").await.unwrap();
        ledger.suspend_wallet(&to.id).await.unwrap();

        let err = ledger
            .transfer(&from.id, &to.id, Money::from_major(50).unwrap(), "tx-1")
            .await
            .unwrap_err();
        match err {
            WalletError::TransferStranded {
                from_wallet_id,
                credit_error,
                ..
            } => {
                assert_eq!(from_wallet_id, from.id);
                assert!(credit_error.contains("suspended"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            ledger.balance_of(&from.id).await.unwrap(),
            Money::from_major(150).unwrap()
        );
    }
}
