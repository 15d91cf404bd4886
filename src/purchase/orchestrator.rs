//! Purchase state machine
//!
//! `Requested → Validated → Reserved → Debited → Committed`, with
//! `Rejected` and `DebitFailed → RolledBack` as the failure exits. The
//! record is persisted after every transition so an interrupted purchase
//! can be finished or rolled back by [`PurchaseOrchestrator::resume_incomplete`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::{PurchaseError, PurchaseRequest};
use crate::config::CompensationPolicy;
use crate::ledger::ownership::OwnershipLedger;
use crate::ledger::wallet::WalletLedger;
use crate::locks::{KeyGuard, KeyedLocks};
use crate::money::Percentage;
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::{validate_identifier, validate_positive_amount, validate_reference};

/// Outcome of a crash-recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Purchase ids whose debit had completed and are now committed
    pub committed: Vec<String>,
    /// Purchase ids whose reservation was released
    pub rolled_back: Vec<String>,
    /// Purchase ids interrupted before anything was reserved
    pub rejected: Vec<String>,
    /// Purchase ids that could not be recovered, with the reason
    pub failed: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Coordinates the ownership and wallet ledgers for one purchase
pub struct PurchaseOrchestrator<S: LedgerStorage> {
    storage: S,
    ownership: Arc<OwnershipLedger<S>>,
    wallets: Arc<WalletLedger<S>>,
    request_locks: KeyedLocks,
    compensation: CompensationPolicy,
}

impl<S: LedgerStorage> PurchaseOrchestrator<S> {
    pub fn new(
        storage: S,
        ownership: Arc<OwnershipLedger<S>>,
        wallets: Arc<WalletLedger<S>>,
        compensation: CompensationPolicy,
    ) -> Self {
        Self {
            storage,
            ownership,
            wallets,
            request_locks: KeyedLocks::new(),
            compensation,
        }
    }

    /// Buy a fraction of an asset.
    ///
    /// Replaying a committed idempotency key returns the original token.
    /// Rejected and rolled-back attempts are not cached, so a retry with the
    /// same key runs again.
    #[instrument(skip(self, request), fields(
        asset_id = %request.asset_id,
        investor_id = %request.investor_id,
        amount = %request.amount,
        key = %request.idempotency_key
    ))]
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<OwnershipToken, PurchaseError> {
        validate_reference(&request.idempotency_key)?;
        validate_identifier("Asset ID", &request.asset_id)?;
        validate_identifier("Investor ID", &request.investor_id)?;
        validate_positive_amount(request.amount)?;

        let _request_guard = self
            .request_locks
            .lock(&request.idempotency_key)
            .await?;

        if let Some(existing) = self.storage.get_purchase(&request.idempotency_key).await? {
            if !existing.matches(&request.asset_id, &request.investor_id, request.amount) {
                warn!(purchase_id = %existing.id, "idempotency key reused with different parameters");
                return Err(PurchaseError::IdempotencyConflict(request.idempotency_key));
            }

            let existing = if existing.state.is_terminal() {
                existing
            } else {
                // Nobody else holds the key lock: this attempt was interrupted.
                self.recover(existing).await?
            };

            if existing.state == PurchaseState::Committed {
                debug!(purchase_id = %existing.id, "replayed committed purchase");
                let token_id = existing.token_id.as_deref().unwrap_or(&existing.id);
                return Ok(self.ownership.token(token_id).await?);
            }
        }

        let mut record = PurchaseRecord::new(
            &request.idempotency_key,
            &request.asset_id,
            &request.investor_id,
            request.amount,
        );
        self.storage.save_purchase(&record).await?;
        info!(purchase_id = %record.id, "purchase requested");

        let guard = self.ownership.lock_asset(&request.asset_id).await?;

        let (wallet, fraction) = match self.validate(&record).await {
            Ok(validated) => validated,
            Err(err) => return Err(self.reject(&mut record, err).await),
        };
        record.wallet_id = Some(wallet.id.clone());
        record.fraction = Some(fraction);
        self.advance(&mut record, PurchaseState::Validated).await?;

        let token = match self
            .ownership
            .reserve_fraction_locked(
                &guard,
                record.id.clone(),
                &record.asset_id,
                fraction,
                &record.investor_id,
                record.amount,
            )
            .await
        {
            Ok(token) => token,
            Err(err) => return Err(self.reject(&mut record, err.into()).await),
        };
        record.token_id = Some(token.id.clone());
        self.advance(&mut record, PurchaseState::Reserved).await?;

        match self.wallets.debit(&wallet.id, record.amount, &record.id).await {
            Ok(transaction_id) => {
                record.debit_transaction_id = Some(transaction_id);
                self.advance(&mut record, PurchaseState::Debited).await?;
                self.commit(&guard, &mut record).await
            }
            Err(err) => {
                let err = PurchaseError::from(err);
                record.failure_reason = Some(err.to_string());
                self.advance(&mut record, PurchaseState::DebitFailed).await?;
                self.compensate(&guard, &mut record).await?;
                Err(err)
            }
        }
    }

    /// Check the request against the asset and the investor's wallet and
    /// work out the fraction it buys
    async fn validate(&self, record: &PurchaseRecord) -> Result<(Wallet, Percentage), PurchaseError> {
        let asset = self.ownership.asset(&record.asset_id).await?;

        if !asset.is_available() {
            return Err(PurchaseError::AssetUnavailable {
                asset_id: asset.id,
                status: asset.status,
            });
        }

        if record.amount < asset.min_investment {
            return Err(PurchaseError::BelowMinInvestment {
                asset_id: asset.id,
                amount: record.amount,
                minimum: asset.min_investment,
            });
        }

        let remaining = asset.ownership_remaining();
        if !remaining.admits(record.amount, asset.current_value) {
            return Err(PurchaseError::Overallocated {
                asset_id: asset.id,
                requested_bps: record.amount.ratio_bps(asset.current_value)?,
                remaining,
            });
        }

        // Rounding may push the fraction a basis point past what is left.
        let fraction = Percentage::fraction_of(record.amount, asset.current_value)?.min(remaining);
        if fraction.is_zero() {
            return Err(PurchaseError::InvalidRequest(format!(
                "Amount {} buys less than 0.01% of asset {}",
                record.amount, asset.id
            )));
        }

        let wallet = self.wallets.wallet_for_owner(&record.investor_id).await?;
        Ok((wallet, fraction))
    }

    async fn advance(&self, record: &mut PurchaseRecord, next: PurchaseState) -> Result<(), PurchaseError> {
        record.transition(next)?;
        self.storage.save_purchase(record).await?;
        debug!(purchase_id = %record.id, state = ?next, "purchase state changed");
        Ok(())
    }

    /// Record a rejection and hand back the error that caused it
    async fn reject(&self, record: &mut PurchaseRecord, err: PurchaseError) -> PurchaseError {
        record.failure_reason = Some(err.to_string());
        if let Err(save_err) = self.advance(record, PurchaseState::Rejected).await {
            error!(purchase_id = %record.id, error = %save_err, "failed to record purchase rejection");
            return save_err;
        }
        info!(purchase_id = %record.id, reason = %err, "purchase rejected");
        err
    }

    async fn commit(&self, guard: &KeyGuard, record: &mut PurchaseRecord) -> Result<OwnershipToken, PurchaseError> {
        let token_id = record.token_id.clone().unwrap_or_else(|| record.id.clone());
        let transaction_id = record.debit_transaction_id.clone().unwrap_or_default();
        let token = self
            .ownership
            .settle_token_locked(guard, &token_id, &transaction_id)
            .await?;
        self.advance(record, PurchaseState::Committed).await?;
        info!(
            purchase_id = %record.id,
            token_id = %token.id,
            fraction = %token.fraction_owned,
            "purchase committed"
        );
        Ok(token)
    }

    /// Release the reservation of a purchase whose debit failed, retrying
    /// with exponential backoff
    async fn compensate(&self, guard: &KeyGuard, record: &mut PurchaseRecord) -> Result<(), PurchaseError> {
        let token_id = record.token_id.clone().unwrap_or_else(|| record.id.clone());
        let max_attempts = self.compensation.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.ownership.release_fraction_locked(guard, &token_id).await {
                Ok(_) => {
                    self.advance(record, PurchaseState::RolledBack).await?;
                    info!(purchase_id = %record.id, attempt, "purchase rolled back");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        purchase_id = %record.id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "reservation release failed"
                    );
                    last_error = err.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.compensation.backoff(attempt)).await;
                    }
                }
            }
        }

        error!(
            purchase_id = %record.id,
            token_id = %token_id,
            "reservation still held after all release attempts"
        );
        Err(PurchaseError::CompensationFailed {
            purchase_id: record.id.clone(),
            reason: last_error,
        })
    }

    /// Drive an interrupted record to a terminal state.
    /// Caller holds the idempotency-key lock.
    async fn recover(&self, mut record: PurchaseRecord) -> Result<PurchaseRecord, PurchaseError> {
        let guard = self.ownership.lock_asset(&record.asset_id).await?;

        match record.state {
            PurchaseState::Requested | PurchaseState::Validated => {
                // The token may have been minted just before the crash.
                if self.storage.get_token(&record.id).await?.is_some() {
                    self.ownership.release_fraction_locked(&guard, &record.id).await?;
                }
                record.failure_reason = Some("interrupted before reservation".to_string());
                self.advance(&mut record, PurchaseState::Rejected).await?;
            }
            PurchaseState::Reserved => {
                let debit = match record.wallet_id.as_deref() {
                    Some(wallet_id) => self.wallets.completed_transaction(wallet_id, &record.id).await?,
                    None => None,
                };
                match debit {
                    Some(transaction) => {
                        record.debit_transaction_id = Some(transaction.id);
                        self.advance(&mut record, PurchaseState::Debited).await?;
                        self.commit(&guard, &mut record).await?;
                    }
                    None => {
                        record.failure_reason = Some("interrupted before debit completed".to_string());
                        self.advance(&mut record, PurchaseState::DebitFailed).await?;
                        self.compensate(&guard, &mut record).await?;
                    }
                }
            }
            PurchaseState::Debited => {
                self.commit(&guard, &mut record).await?;
            }
            PurchaseState::DebitFailed => {
                self.compensate(&guard, &mut record).await?;
            }
            PurchaseState::Committed | PurchaseState::Rejected | PurchaseState::RolledBack => {}
        }

        info!(purchase_id = %record.id, state = ?record.state, "interrupted purchase recovered");
        Ok(record)
    }

    /// Finish or roll back every purchase left mid-flight, e.g. after a
    /// crash or an exhausted compensation retry budget
    #[instrument(skip(self))]
    pub async fn resume_incomplete(&self) -> Result<RecoveryReport, PurchaseError> {
        let mut report = RecoveryReport::default();

        for stale in self.storage.list_purchases().await? {
            if stale.state.is_terminal() {
                continue;
            }

            let _request_guard = self.request_locks.lock(&stale.idempotency_key).await?;
            let Some(record) = self.storage.get_purchase(&stale.idempotency_key).await? else {
                continue;
            };
            if record.state.is_terminal() || record.id != stale.id {
                continue;
            }

            let purchase_id = record.id.clone();
            match self.recover(record).await {
                Ok(recovered) => match recovered.state {
                    PurchaseState::Committed => report.committed.push(purchase_id),
                    PurchaseState::RolledBack => report.rolled_back.push(purchase_id),
                    _ => report.rejected.push(purchase_id),
                },
                Err(err) => {
                    error!(purchase_id = %purchase_id, error = %err, "purchase recovery failed");
                    report.failed.push((purchase_id, err.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// The stored record for an idempotency key
    pub async fn purchase_record(&self, idempotency_key: &str) -> LedgerResult<Option<PurchaseRecord>> {
        self.storage.get_purchase(idempotency_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::policy::DistributionPolicy;
    use crate::ledger::ownership::NewAsset;
    use crate::money::Money;
    use crate::utils::memory_storage::MemoryStorage;

    struct Fixture {
        storage: MemoryStorage,
        ownership: Arc<OwnershipLedger<MemoryStorage>>,
        wallets: Arc<WalletLedger<MemoryStorage>>,
        orchestrator: PurchaseOrchestrator<MemoryStorage>,
    }

    async fn fixture() -> Fixture {
        let storage = MemoryStorage::new();
        storage
            .save_policy(&DistributionPolicy::vehicle().unwrap())
            .await
            .unwrap();
        let ownership = Arc::new(OwnershipLedger::new(storage.clone()));
        let wallets = Arc::new(WalletLedger::new(storage.clone()));
        ownership
            .register_asset(NewAsset {
                id: "keke-01".to_string(),
                name: "Keke 01".to_string(),
                asset_type: AssetType::Vehicle,
                current_value: Money::from_major(100_000).unwrap(),
                min_investment: Money::from_major(1_000).unwrap(),
                revenue_policy_id: "vehicle".to_string(),
            })
            .await
            .unwrap();

        let orchestrator = PurchaseOrchestrator::new(
            storage.clone(),
            ownership.clone(),
            wallets.clone(),
            CompensationPolicy {
                max_attempts: 4,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        );
        Fixture {
            storage,
            ownership,
            wallets,
            orchestrator,
        }
    }

    async fn fund(f: &Fixture, owner: &str, major: i64) -> Wallet {
        let wallet = f.wallets.open_wallet(owner).await.unwrap();
        if major > 0 {
            f.wallets
                .record_deposit(&wallet.id, Money::from_major(major).unwrap(), Money::ZERO, &format!("dep-{}", owner))
                .await
                .unwrap();
        }
        wallet
    }

    fn request(investor: &str, major: i64, key: &str) -> PurchaseRequest {
        PurchaseRequest::new("keke-01", investor, Money::from_major(major).unwrap(), key)
    }

    #[tokio::test]
    async fn test_purchase_commits() {
        let f = fixture().await;
        let wallet = fund(&f, "investor-1", 50_000).await;

        let token = f.orchestrator.purchase(request("investor-1", 25_000, "k-1")).await.unwrap();
        assert_eq!(token.fraction_owned, Percentage::from_whole(25).unwrap());
        assert!(token.settlement_reference.is_some());

        let record = f.orchestrator.purchase_record("k-1").await.unwrap().unwrap();
        assert_eq!(record.state, PurchaseState::Committed);
        let states: Vec<PurchaseState> = record.history.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                PurchaseState::Requested,
                PurchaseState::Validated,
                PurchaseState::Reserved,
                PurchaseState::Debited,
                PurchaseState::Committed
            ]
        );
        assert_eq!(
            f.wallets.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(25_000).unwrap()
        );
    }

    #[tokio::test]
    async fn test_replay_returns_original_token() {
        let f = fixture().await;
        let wallet = fund(&f, "investor-1", 50_000).await;

        let first = f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.unwrap();
        let second = f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            f.wallets.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(40_000).unwrap()
        );
        assert_eq!(f.ownership.tokens_for("keke-01").await.unwrap().len(), 1);

        let err = f
            .orchestrator
            .purchase(request("investor-1", 12_000, "k-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PurchaseError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds_rolls_back_reservation() {
        let f = fixture().await;
        let wallet = fund(&f, "investor-1", 5_000).await;

        let err = f
            .orchestrator
            .purchase(request("investor-1", 10_000, "k-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PurchaseError::InsufficientFunds { .. }));
        assert_eq!(err.category(), crate::purchase::ErrorCategory::Resource);

        let asset = f.ownership.asset("keke-01").await.unwrap();
        assert_eq!(asset.total_ownership_sold, Percentage::ZERO);
        assert_eq!(
            f.wallets.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(5_000).unwrap()
        );

        let record = f.orchestrator.purchase_record("k-1").await.unwrap().unwrap();
        assert_eq!(record.state, PurchaseState::RolledBack);
        let token = f.ownership.token(&record.id).await.unwrap();
        assert_eq!(token.status, TokenStatus::Burned);
    }

    #[tokio::test]
    async fn test_rolled_back_key_can_be_retried() {
        let f = fixture().await;
        let wallet = fund(&f, "investor-1", 5_000).await;

        assert!(f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.is_err());
        f.wallets
            .record_deposit(&wallet.id, Money::from_major(5_000).unwrap(), Money::ZERO, "top-up")
            .await
            .unwrap();

        let token = f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.unwrap();
        assert!(token.is_active());
        assert_eq!(
            f.ownership.asset("keke-01").await.unwrap().total_ownership_sold,
            Percentage::from_whole(10).unwrap()
        );
    }

    #[tokio::test]
    async fn test_validation_rejects_before_mutation() {
        let f = fixture().await;
        fund(&f, "investor-1", 50_000).await;

        let err = f.orchestrator.purchase(request("investor-1", 500, "k-1")).await.unwrap_err();
        assert!(matches!(err, PurchaseError::BelowMinInvestment { .. }));

        let err = f.orchestrator.purchase(request("nobody", 5_000, "k-2")).await.unwrap_err();
        assert!(matches!(err, PurchaseError::WalletNotFound(_)));

        let record = f.orchestrator.purchase_record("k-1").await.unwrap().unwrap();
        assert_eq!(record.state, PurchaseState::Rejected);
        assert!(f.ownership.tokens_for("keke-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overallocation_rejected() {
        let f = fixture().await;
        fund(&f, "investor-1", 100_000).await;
        fund(&f, "investor-2", 100_000).await;

        f.orchestrator.purchase(request("investor-1", 70_000, "k-1")).await.unwrap();
        let err = f.orchestrator.purchase(request("investor-2", 35_000, "k-2")).await.unwrap_err();
        match err {
            PurchaseError::Overallocated { requested_bps, remaining, .. } => {
                assert_eq!(requested_bps, 3_500);
                assert_eq!(remaining, Percentage::from_whole(30).unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_overallocation_reports_exact_share_above_asset_value() {
        let f = fixture().await;
        fund(&f, "investor-1", 200_000).await;

        let err = f.orchestrator.purchase(request("investor-1", 150_000, "k-1")).await.unwrap_err();
        match err {
            PurchaseError::Overallocated { requested_bps, remaining, .. } => {
                assert_eq!(requested_bps, 15_000);
                assert_eq!(remaining, Percentage::HUNDRED);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.ownership.tokens_for("keke-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_suspended_wallet_triggers_compensation() {
        let f = fixture().await;
        let wallet = fund(&f, "investor-1", 50_000).await;
        f.wallets.suspend_wallet(&wallet.id).await.unwrap();

        let err = f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.unwrap_err();
        assert!(matches!(err, PurchaseError::WalletSuspended(_)));
        assert_eq!(
            f.ownership.asset("keke-01").await.unwrap().total_ownership_sold,
            Percentage::ZERO
        );
    }

    #[tokio::test]
    async fn test_compensation_retries_transient_failures() {
        let f = fixture().await;
        fund(&f, "investor-1", 1_000).await;
        f.storage.fail_next_token_writes(2);

        let err = f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.unwrap_err();
        assert!(matches!(err, PurchaseError::InsufficientFunds { .. }));
        assert_eq!(
            f.ownership.asset("keke-01").await.unwrap().total_ownership_sold,
            Percentage::ZERO
        );
    }

    #[tokio::test]
    async fn test_exhausted_compensation_is_resumed() {
        let f = fixture().await;
        fund(&f, "investor-1", 1_000).await;
        f.storage.fail_next_token_writes(10);

        let err = f.orchestrator.purchase(request("investor-1", 10_000, "k-1")).await.unwrap_err();
        assert!(matches!(err, PurchaseError::CompensationFailed { .. }));
        let record = f.orchestrator.purchase_record("k-1").await.unwrap().unwrap();
        assert_eq!(record.state, PurchaseState::DebitFailed);

        f.storage.fail_next_token_writes(0);
        let report = f.orchestrator.resume_incomplete().await.unwrap();
        assert_eq!(report.rolled_back, vec![record.id.clone()]);
        assert!(report.is_clean());
        assert_eq!(
            f.ownership.asset("keke-01").await.unwrap().total_ownership_sold,
            Percentage::ZERO
        );
    }

    #[tokio::test]
    async fn test_resume_commits_completed_debit() {
        let f = fixture().await;
        let wallet = fund(&f, "investor-1", 50_000).await;

        // Simulate a crash right after the debit completed.
        let mut record = PurchaseRecord::new("k-1", "keke-01", "investor-1", Money::from_major(10_000).unwrap());
        record.wallet_id = Some(wallet.id.clone());
        record.fraction = Some(Percentage::from_whole(10).unwrap());
        record.transition(PurchaseState::Validated).unwrap();
        {
            let guard = f.ownership.lock_asset("keke-01").await.unwrap();
            f.ownership
                .reserve_fraction_locked(
                    &guard,
                    record.id.clone(),
                    "keke-01",
                    Percentage::from_whole(10).unwrap(),
                    "investor-1",
                    record.amount,
                )
                .await
                .unwrap();
        }
        record.token_id = Some(record.id.clone());
        record.transition(PurchaseState::Reserved).unwrap();
        f.storage.save_purchase(&record).await.unwrap();
        f.wallets.debit(&wallet.id, record.amount, &record.id).await.unwrap();

        let report = f.orchestrator.resume_incomplete().await.unwrap();
        assert_eq!(report.committed, vec![record.id.clone()]);

        let stored = f.orchestrator.purchase_record("k-1").await.unwrap().unwrap();
        assert_eq!(stored.state, PurchaseState::Committed);
        assert_eq!(
            f.wallets.balance_of(&wallet.id).await.unwrap(),
            Money::from_major(40_000).unwrap()
        );
        assert!(f.ownership.token(&record.id).await.unwrap().is_active());
    }
}
