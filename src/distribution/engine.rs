//! Revenue distribution engine
//!
//! Splits a period's gross revenue across the asset's stakeholder tiers,
//! prorates the investor pool over the active ownership tokens and credits
//! every owner's wallet.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::ledger::ownership::{active_fraction_total, OwnershipLedger};
use crate::ledger::wallet::WalletLedger;
use crate::locks::KeyGuard;
use crate::money::{Money, Percentage};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::validate_period;

/// Errors raised while distributing revenue
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("Revenue for asset {asset_id} in period {period} has already been distributed")]
    AlreadyDistributed { asset_id: String, period: String },
    #[error("Asset {0} has no active ownership tokens")]
    NoActiveTokens(String),
    #[error("Invalid gross revenue: {0}")]
    InvalidRevenue(String),
    #[error("Payout {payout_id} has no allocation for token {token_id}")]
    AllocationNotFound { payout_id: String, token_id: String },
    #[error("Credit for token {token_id} failed: {reason}")]
    CreditFailed { token_id: String, reason: String },
    #[error("Distribution invariant violated: {0}")]
    InvariantViolation(String),
    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for DistributionError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvariantViolation(message) => DistributionError::InvariantViolation(message),
            other => DistributionError::Ledger(other),
        }
    }
}

impl From<crate::money::MoneyError> for DistributionError {
    fn from(err: crate::money::MoneyError) -> Self {
        DistributionError::Ledger(LedgerError::Money(err))
    }
}

/// Prorate the investor pool by active fraction.
///
/// Each share is floored; the leftover minor units go to the token with the
/// largest fraction (lowest token id among ties) so the pool is exhausted
/// exactly. Proration is against the sum of the given fractions, not 100%.
pub fn prorate_investor_pool(
    pool: Money,
    tokens: &[(String, Percentage)],
) -> LedgerResult<Vec<Money>> {
    let total_bps: u64 = tokens.iter().map(|(_, f)| u64::from(f.bps())).sum();
    if total_bps == 0 {
        return Err(LedgerError::Validation(
            "Cannot prorate over a zero total fraction".to_string(),
        ));
    }

    let mut shares = tokens
        .iter()
        .map(|(_, fraction)| pool.prorate(u64::from(fraction.bps()), total_bps))
        .collect::<Result<Vec<Money>, _>>()?;

    let distributed = Money::checked_sum(shares.iter().copied())?;
    let remainder = pool.checked_sub(distributed)?;
    if remainder.is_negative() || remainder.minor_units() >= tokens.len() as i64 {
        return Err(LedgerError::InvariantViolation(format!(
            "Proration remainder {} is outside [0, {})",
            remainder,
            tokens.len()
        )));
    }

    if let Some(largest) = tokens
        .iter()
        .enumerate()
        .max_by(|(_, (a_id, a)), (_, (b_id, b))| a.cmp(b).then_with(|| b_id.cmp(a_id)))
        .map(|(index, _)| index)
    {
        shares[largest] = shares[largest].checked_add(remainder)?;
    }

    let total = Money::checked_sum(shares.iter().copied())?;
    if total != pool {
        return Err(LedgerError::InvariantViolation(format!(
            "Investor payouts sum to {} but the pool is {}",
            total, pool
        )));
    }

    Ok(shares)
}

fn payout_reference(payout_id: &str, token_id: &str) -> String {
    format!("{}:{}", payout_id, token_id)
}

fn tier_reference(payout_id: &str, tier: StakeholderTier) -> String {
    format!("{}:tier:{}", payout_id, tier)
}

/// Revenue distribution engine
pub struct RevenueDistributor<S: LedgerStorage> {
    storage: S,
    ownership: Arc<OwnershipLedger<S>>,
    wallets: Arc<WalletLedger<S>>,
}

impl<S: LedgerStorage> RevenueDistributor<S> {
    pub fn new(storage: S, ownership: Arc<OwnershipLedger<S>>, wallets: Arc<WalletLedger<S>>) -> Self {
        Self {
            storage,
            ownership,
            wallets,
        }
    }

    /// Distribute one period's gross revenue for an asset.
    ///
    /// Runs at most once per `(asset, period)`. Individual credit failures
    /// are recorded on the returned payout rather than undoing the rest.
    #[instrument(skip(self), fields(gross = %gross_revenue))]
    pub async fn distribute(
        &self,
        asset_id: &str,
        period: &str,
        gross_revenue: Money,
    ) -> Result<Payout, DistributionError> {
        validate_period(period)?;
        if !gross_revenue.is_positive() {
            return Err(DistributionError::InvalidRevenue(format!(
                "Gross revenue must be positive, got {}",
                gross_revenue
            )));
        }

        let guard = self.ownership.lock_asset(asset_id).await?;

        if self.storage.find_payout(asset_id, period).await?.is_some() {
            warn!(asset_id, period, "distribution already recorded for period");
            return Err(DistributionError::AlreadyDistributed {
                asset_id: asset_id.to_string(),
                period: period.to_string(),
            });
        }

        let asset = self.ownership.asset(asset_id).await?;
        let policy = self
            .storage
            .get_policy(&asset.revenue_policy_id)
            .await?
            .ok_or_else(|| LedgerError::PolicyNotFound(asset.revenue_policy_id.clone()))?;

        let tokens = self.ownership.tokens_for_locked(&guard, asset_id).await?;
        if tokens.is_empty() {
            return Err(DistributionError::NoActiveTokens(asset_id.to_string()));
        }

        let mut payout = match self.plan(&asset, &policy, period, gross_revenue, &tokens) {
            Ok(payout) => payout,
            Err(err) => {
                error!(asset_id, period, error = %err, "distribution aborted");
                return Err(err);
            }
        };
        self.storage.save_payout(&payout).await?;

        for index in 0..payout.allocations.len() {
            self.credit_allocation(&guard, &mut payout, index).await?;
        }
        for index in 0..payout.tier_credits.len() {
            self.credit_tier(&mut payout, index).await?;
        }

        if payout.is_partial() {
            warn!(
                payout_id = %payout.id,
                failed = payout.failed_allocations().len(),
                "distribution partially succeeded"
            );
        } else {
            info!(
                payout_id = %payout.id,
                investor_pool = %payout.investor_pool,
                tokens = payout.allocations.len(),
                "distribution completed"
            );
        }
        Ok(payout)
    }

    /// Compute the complete payout before anything is persisted
    fn plan(
        &self,
        asset: &Asset,
        policy: &crate::distribution::policy::DistributionPolicy,
        period: &str,
        gross_revenue: Money,
        tokens: &[OwnershipToken],
    ) -> Result<Payout, DistributionError> {
        let tier_amounts = policy.split(gross_revenue)?;
        let investor_pool = tier_amounts
            .iter()
            .find(|t| t.tier == StakeholderTier::Investor)
            .map(|t| t.amount)
            .ok_or_else(|| {
                DistributionError::InvariantViolation(format!(
                    "Policy '{}' produced no investor tier",
                    policy.id
                ))
            })?;

        let snapshot_fraction = active_fraction_total(tokens)?;
        let fractions: Vec<(String, Percentage)> = tokens
            .iter()
            .map(|t| (t.id.clone(), t.fraction_owned))
            .collect();
        let shares = prorate_investor_pool(investor_pool, &fractions)?;

        let allocations: Vec<InvestorAllocation> = tokens
            .iter()
            .zip(shares)
            .map(|(token, amount)| InvestorAllocation {
                token_id: token.id.clone(),
                owner_id: token.owner_id.clone(),
                fraction: token.fraction_owned,
                amount,
                status: if amount.is_zero() {
                    CreditStatus::Skipped
                } else {
                    CreditStatus::Pending
                },
                transaction_id: None,
                failure_reason: None,
            })
            .collect();

        let tier_credits: Vec<TierCredit> = tier_amounts
            .iter()
            .filter(|t| t.tier != StakeholderTier::Investor)
            .filter_map(|t| {
                t.beneficiary_owner_id.as_ref().map(|owner_id| TierCredit {
                    tier: t.tier,
                    owner_id: owner_id.clone(),
                    amount: t.amount,
                    status: if t.amount.is_zero() {
                        CreditStatus::Skipped
                    } else {
                        CreditStatus::Pending
                    },
                    transaction_id: None,
                    failure_reason: None,
                })
            })
            .collect();

        let now = now();
        Ok(Payout {
            id: new_id(),
            asset_id: asset.id.clone(),
            period: period.to_string(),
            policy_id: policy.id.clone(),
            gross_revenue,
            tier_amounts,
            investor_pool,
            snapshot_fraction,
            allocations,
            tier_credits,
            created_at: now,
            updated_at: now,
        })
    }

    /// Stored status always follows the wallet log: the payout is written
    /// back after every credit attempt.
    async fn persist(&self, payout: &mut Payout) -> Result<(), DistributionError> {
        payout.updated_at = now();
        self.storage.update_payout(payout).await?;
        Ok(())
    }

    /// Credit one investor allocation and record the token's returns.
    ///
    /// Both steps are idempotent (wallet reference, payout id on the token),
    /// so an allocation left `Pending` or `Failed` can always be replayed.
    async fn credit_allocation(
        &self,
        guard: &KeyGuard,
        payout: &mut Payout,
        index: usize,
    ) -> Result<(), DistributionError> {
        let allocation = payout.allocations[index].clone();
        if !matches!(allocation.status, CreditStatus::Pending | CreditStatus::Failed) {
            return Ok(());
        }

        let reference = payout_reference(&payout.id, &allocation.token_id);
        let result = match self.wallets.wallet_for_owner(&allocation.owner_id).await {
            Ok(wallet) => {
                self.wallets
                    .credit(&wallet.id, allocation.amount, &reference)
                    .await
            }
            Err(err) => Err(err),
        };

        let transaction_id = match result {
            Ok(transaction_id) => transaction_id,
            Err(err) => {
                warn!(
                    payout_id = %payout.id,
                    token_id = %allocation.token_id,
                    error = %err,
                    "investor credit failed"
                );
                let entry = &mut payout.allocations[index];
                entry.status = CreditStatus::Failed;
                entry.failure_reason = Some(err.to_string());
                return self.persist(payout).await;
            }
        };

        let recorded = self
            .ownership
            .add_returns_locked(guard, &allocation.token_id, &payout.id, allocation.amount)
            .await;
        let entry = &mut payout.allocations[index];
        entry.transaction_id = Some(transaction_id);
        match recorded {
            Ok(_) => {
                entry.status = CreditStatus::Credited;
                entry.failure_reason = None;
            }
            Err(err) => {
                // Wallet already credited; a retry replays the credit and
                // records the returns.
                error!(
                    payout_id = %payout.id,
                    token_id = %allocation.token_id,
                    error = %err,
                    "investor credited but returns not recorded"
                );
                entry.status = CreditStatus::Failed;
                entry.failure_reason = Some(format!("returns not recorded: {}", err));
            }
        }
        self.persist(payout).await
    }

    async fn credit_tier(&self, payout: &mut Payout, index: usize) -> Result<(), DistributionError> {
        let credit = &payout.tier_credits[index];
        if !matches!(credit.status, CreditStatus::Pending | CreditStatus::Failed) {
            return Ok(());
        }

        let reference = tier_reference(&payout.id, credit.tier);
        let result = match self.wallets.wallet_for_owner(&credit.owner_id).await {
            Ok(wallet) => self.wallets.credit(&wallet.id, credit.amount, &reference).await,
            Err(err) => Err(err),
        };

        let credit = &mut payout.tier_credits[index];
        match result {
            Ok(transaction_id) => {
                credit.status = CreditStatus::Credited;
                credit.transaction_id = Some(transaction_id);
                credit.failure_reason = None;
            }
            Err(err) => {
                warn!(tier = %credit.tier, owner_id = %credit.owner_id, error = %err, "tier credit failed");
                credit.status = CreditStatus::Failed;
                credit.failure_reason = Some(err.to_string());
            }
        }
        self.persist(payout).await
    }

    /// Retry one investor credit that failed during a distribution.
    ///
    /// Uses the original credit reference, so a credit that actually went
    /// through is never paid twice.
    #[instrument(skip(self))]
    pub async fn retry_failed_credit(
        &self,
        payout_id: &str,
        token_id: &str,
    ) -> Result<InvestorAllocation, DistributionError> {
        let asset_id = self
            .storage
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| LedgerError::PayoutNotFound(payout_id.to_string()))?
            .asset_id;

        let guard = self.ownership.lock_asset(&asset_id).await?;
        let mut payout = self
            .storage
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| LedgerError::PayoutNotFound(payout_id.to_string()))?;

        let index = payout
            .allocations
            .iter()
            .position(|a| a.token_id == token_id)
            .ok_or_else(|| DistributionError::AllocationNotFound {
                payout_id: payout_id.to_string(),
                token_id: token_id.to_string(),
            })?;

        self.credit_allocation(&guard, &mut payout, index).await?;

        let allocation = payout.allocations[index].clone();
        if allocation.status == CreditStatus::Failed {
            return Err(DistributionError::CreditFailed {
                token_id: token_id.to_string(),
                reason: allocation.failure_reason.unwrap_or_default(),
            });
        }

        info!(payout_id, token_id, "failed credit retried successfully");
        Ok(allocation)
    }

    /// Retry every failed tier credit of a payout
    pub async fn retry_failed_tier_credits(&self, payout_id: &str) -> Result<Payout, DistributionError> {
        let asset_id = self
            .storage
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| LedgerError::PayoutNotFound(payout_id.to_string()))?
            .asset_id;

        let _guard = self.ownership.lock_asset(&asset_id).await?;
        let mut payout = self
            .storage
            .get_payout(payout_id)
            .await?
            .ok_or_else(|| LedgerError::PayoutNotFound(payout_id.to_string()))?;

        for index in 0..payout.tier_credits.len() {
            self.credit_tier(&mut payout, index).await?;
        }
        Ok(payout)
    }

    /// The payout for an asset and period, if distributed
    pub async fn payout(&self, asset_id: &str, period: &str) -> LedgerResult<Option<Payout>> {
        self.storage.find_payout(asset_id, period).await
    }

    /// All payouts for an asset, ordered by period
    pub async fn payouts_for_asset(&self, asset_id: &str) -> LedgerResult<Vec<Payout>> {
        self.storage.list_payouts_for_asset(asset_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pct(bps: u32) -> Percentage {
        Percentage::from_bps(bps).unwrap()
    }

    #[test]
    fn test_prorate_reference_example() {
        let shares = prorate_investor_pool(
            Money::from_major(5_500).unwrap(),
            &[("a".to_string(), pct(6_000)), ("b".to_string(), pct(4_000))],
        )
        .unwrap();
        assert_eq!(shares[0], Money::from_major(3_300).unwrap());
        assert_eq!(shares[1], Money::from_major(2_200).unwrap());
    }

    #[test]
    fn test_prorate_against_partial_allocation() {
        // 80% sold: the pool is split over the 80% that exists
        let shares = prorate_investor_pool(
            Money::from_major(1_000).unwrap(),
            &[("a".to_string(), pct(6_000)), ("b".to_string(), pct(2_000))],
        )
        .unwrap();
        assert_eq!(shares[0], Money::from_major(750).unwrap());
        assert_eq!(shares[1], Money::from_major(250).unwrap());
    }

    #[test]
    fn test_remainder_goes_to_largest_then_lowest_id() {
        let shares = prorate_investor_pool(
            Money::from_minor(100),
            &[
                ("c".to_string(), pct(1_000)),
                ("b".to_string(), pct(1_000)),
                ("a".to_string(), pct(1_000)),
            ],
        )
        .unwrap();
        // 33 each, remainder 1 goes to the lowest id among equal fractions
        assert_eq!(shares, vec![Money::from_minor(33), Money::from_minor(33), Money::from_minor(34)]);

        let shares = prorate_investor_pool(
            Money::from_minor(10),
            &[("a".to_string(), pct(1_000)), ("b".to_string(), pct(2_000))],
        )
        .unwrap();
        // 3.33 and 6.67 floor to 3 and 6; the larger fraction takes the leftover
        assert_eq!(shares, vec![Money::from_minor(3), Money::from_minor(7)]);
    }

    #[test]
    fn test_prorate_rejects_empty_snapshot() {
        assert!(prorate_investor_pool(Money::from_minor(100), &[]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: prorated investor payouts always exhaust the pool exactly.
        #[test]
        fn proration_is_exact(
            pool in 0i64..1_000_000_000i64,
            fractions in prop::collection::vec(1u32..2_000u32, 1..6)
        ) {
            let tokens: Vec<(String, Percentage)> = fractions
                .iter()
                .enumerate()
                .map(|(i, bps)| (format!("token-{}", i), Percentage::from_bps(*bps).unwrap()))
                .collect();
            let pool = Money::from_minor(pool);
            let shares = prorate_investor_pool(pool, &tokens).unwrap();
            let total = Money::checked_sum(shares.iter().copied()).unwrap();
            prop_assert_eq!(total, pool);
            prop_assert!(shares.iter().all(|s| !s.is_negative()));
        }
    }
}
