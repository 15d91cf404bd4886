//! Ownership ledger: per-asset bookkeeping of sold fractions and tokens

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::locks::{KeyGuard, KeyedLocks};
use crate::money::{Money, Percentage};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::validate_identifier;

/// Errors raised by ownership operations
#[derive(Debug, thiserror::Error)]
pub enum OwnershipError {
    #[error("Requested fraction {requested} exceeds remaining ownership {remaining} of asset {asset_id}")]
    Overallocated {
        asset_id: String,
        requested: Percentage,
        remaining: Percentage,
    },
    #[error("Asset {asset_id} is not available for purchase (status: {status:?})")]
    AssetUnavailable {
        asset_id: String,
        status: AssetStatus,
    },
    #[error("Investment {amount} is below the minimum {minimum} for asset {asset_id}")]
    BelowMinInvestment {
        asset_id: String,
        amount: Money,
        minimum: Money,
    },
    #[error("Invalid fraction: {0}")]
    InvalidFraction(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<crate::money::MoneyError> for OwnershipError {
    fn from(err: crate::money::MoneyError) -> Self {
        OwnershipError::Ledger(LedgerError::Money(err))
    }
}

/// Parameters for registering an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAsset {
    pub id: String,
    pub name: String,
    pub asset_type: AssetType,
    pub current_value: Money,
    pub min_investment: Money,
    pub revenue_policy_id: String,
}

/// Recorded sold fraction compared with the active tokens behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationCheck {
    pub asset_id: String,
    pub recorded_sold: Percentage,
    pub active_token_total: Percentage,
    pub is_consistent: bool,
}

/// Sum of active fractions. Errors if the tokens claim more than 100%.
pub fn active_fraction_total(tokens: &[OwnershipToken]) -> LedgerResult<Percentage> {
    tokens
        .iter()
        .filter(|t| t.is_active())
        .try_fold(Percentage::ZERO, |acc, t| acc.checked_add(t.fraction_owned))
        .map_err(LedgerError::from)
}

/// Ownership ledger; the only writer of `total_ownership_sold`
pub struct OwnershipLedger<S: LedgerStorage> {
    storage: S,
    locks: KeyedLocks,
    validator: Box<dyn AssetValidator>,
}

impl<S: LedgerStorage> OwnershipLedger<S> {
    /// Create a new ownership ledger
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
            validator: Box::new(DefaultAssetValidator),
        }
    }

    /// Create a new ownership ledger with custom validator
    pub fn with_validator(storage: S, validator: Box<dyn AssetValidator>) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
            validator,
        }
    }

    /// Take the per-asset lock. Every read-then-write of an asset's sold
    /// fraction happens while this guard is alive.
    pub async fn lock_asset(&self, asset_id: &str) -> LedgerResult<KeyGuard> {
        self.locks.lock(asset_id).await
    }

    /// Register a new asset with nothing sold
    pub async fn register_asset(&self, new_asset: NewAsset) -> Result<Asset, OwnershipError> {
        let now = now();
        let asset = Asset {
            id: new_asset.id,
            name: new_asset.name,
            asset_type: new_asset.asset_type,
            current_value: new_asset.current_value,
            min_investment: new_asset.min_investment,
            total_ownership_sold: Percentage::ZERO,
            status: AssetStatus::Available,
            revenue_policy_id: new_asset.revenue_policy_id,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };

        // Purchases address assets by this id, whatever validator is plugged in
        validate_identifier("Asset ID", &asset.id)?;
        self.validator.validate_asset(&asset)?;

        if self
            .storage
            .get_policy(&asset.revenue_policy_id)
            .await?
            .is_none()
        {
            return Err(LedgerError::PolicyNotFound(asset.revenue_policy_id.clone()).into());
        }

        let _guard = self.lock_asset(&asset.id).await?;
        if self.storage.get_asset(&asset.id).await?.is_some() {
            return Err(LedgerError::Duplicate(format!("asset '{}'", asset.id)).into());
        }

        self.storage.save_asset(&asset).await?;
        info!(asset_id = %asset.id, value = %asset.current_value, "asset registered");
        Ok(asset)
    }

    /// Get an asset by ID, returning an error if not found
    pub async fn asset(&self, asset_id: &str) -> LedgerResult<Asset> {
        self.storage
            .get_asset(asset_id)
            .await?
            .ok_or_else(|| LedgerError::AssetNotFound(asset_id.to_string()))
    }

    /// List all assets
    pub async fn list_assets(&self) -> LedgerResult<Vec<Asset>> {
        self.storage.list_assets().await
    }

    /// Get a token by ID, returning an error if not found
    pub async fn token(&self, token_id: &str) -> LedgerResult<OwnershipToken> {
        self.storage
            .get_token(token_id)
            .await?
            .ok_or_else(|| LedgerError::TokenNotFound(token_id.to_string()))
    }

    /// Reserve `fraction` of an asset for an investor and mint the token
    pub async fn reserve_fraction(
        &self,
        asset_id: &str,
        fraction: Percentage,
        investor_id: &str,
        amount: Money,
    ) -> Result<OwnershipToken, OwnershipError> {
        let guard = self.lock_asset(asset_id).await?;
        self.reserve_fraction_locked(&guard, new_id(), asset_id, fraction, investor_id, amount)
            .await
    }

    pub(crate) async fn reserve_fraction_locked(
        &self,
        guard: &KeyGuard,
        token_id: String,
        asset_id: &str,
        fraction: Percentage,
        investor_id: &str,
        amount: Money,
    ) -> Result<OwnershipToken, OwnershipError> {
        guard.ensure_covers(asset_id)?;
        let mut asset = self.asset(asset_id).await?;

        if !asset.is_available() {
            return Err(OwnershipError::AssetUnavailable {
                asset_id: asset.id,
                status: asset.status,
            });
        }

        if amount < asset.min_investment {
            return Err(OwnershipError::BelowMinInvestment {
                asset_id: asset.id,
                amount,
                minimum: asset.min_investment,
            });
        }

        if fraction.is_zero() {
            return Err(OwnershipError::InvalidFraction(
                "Fraction must be greater than zero".to_string(),
            ));
        }

        let remaining = asset.ownership_remaining();
        if fraction > remaining {
            return Err(OwnershipError::Overallocated {
                asset_id: asset.id,
                requested: fraction,
                remaining,
            });
        }

        let previous = asset.clone();
        asset.total_ownership_sold = asset.total_ownership_sold.checked_add(fraction)?;
        if asset.total_ownership_sold == Percentage::HUNDRED {
            asset.status = AssetStatus::FullyAllocated;
        }
        asset.touch();
        self.storage.update_asset(&asset).await?;

        let token = OwnershipToken::mint(token_id, asset_id, investor_id, fraction, amount);
        if let Err(err) = self.storage.save_token(&token).await {
            warn!(asset_id, error = %err, "token mint failed, restoring asset");
            self.storage.update_asset(&previous).await?;
            return Err(err.into());
        }

        info!(
            asset_id,
            token_id = %token.id,
            investor_id,
            %fraction,
            sold = %asset.total_ownership_sold,
            "ownership fraction reserved"
        );
        Ok(token)
    }

    /// Return a token's fraction to its asset. Safe to call repeatedly.
    pub async fn release_fraction(&self, token_id: &str) -> LedgerResult<OwnershipToken> {
        let asset_id = self.token(token_id).await?.asset_id;
        let guard = self.lock_asset(&asset_id).await?;
        self.release_fraction_locked(&guard, token_id).await
    }

    /// Release a reservation made for a purchase that could not be paid for.
    /// Safe to call repeatedly.
    pub(crate) async fn release_fraction_locked(
        &self,
        guard: &KeyGuard,
        token_id: &str,
    ) -> LedgerResult<OwnershipToken> {
        let token = self.retire_token_locked(guard, token_id).await?;
        info!(asset_id = %token.asset_id, token_id, "reservation released");
        Ok(token)
    }

    /// Burn a token whose ownership term has ended, returning its fraction
    /// to the asset
    pub async fn burn_token(&self, token_id: &str) -> LedgerResult<OwnershipToken> {
        let asset_id = self.token(token_id).await?.asset_id;
        let guard = self.lock_asset(&asset_id).await?;
        let token = self.retire_token_locked(&guard, token_id).await?;
        info!(asset_id = %asset_id, token_id, "ownership token burned");
        Ok(token)
    }

    /// Burn the token (if still active) and resynchronise the asset's sold
    /// fraction with its remaining active tokens.
    async fn retire_token_locked(
        &self,
        guard: &KeyGuard,
        token_id: &str,
    ) -> LedgerResult<OwnershipToken> {
        let mut token = self.token(token_id).await?;
        guard.ensure_covers(&token.asset_id)?;

        if token.is_active() {
            token.burn();
            self.storage.update_token(&token).await?;
        }

        let mut asset = self.asset(&token.asset_id).await?;
        let tokens = self.storage.list_tokens_for_asset(&asset.id).await?;
        let sold = active_fraction_total(&tokens)?;
        if sold != asset.total_ownership_sold {
            asset.total_ownership_sold = sold;
            if asset.status == AssetStatus::FullyAllocated && sold < Percentage::HUNDRED {
                asset.status = AssetStatus::Available;
            }
            asset.touch();
            self.storage.update_asset(&asset).await?;
        }

        Ok(token)
    }

    /// Attach the settling wallet transaction to a freshly paid token
    pub(crate) async fn settle_token_locked(
        &self,
        guard: &KeyGuard,
        token_id: &str,
        settlement_reference: &str,
    ) -> LedgerResult<OwnershipToken> {
        let mut token = self.token(token_id).await?;
        guard.ensure_covers(&token.asset_id)?;
        if token.settlement_reference.as_deref() != Some(settlement_reference) {
            token.settlement_reference = Some(settlement_reference.to_string());
            self.storage.update_token(&token).await?;
        }
        Ok(token)
    }

    /// Add a payout to a token's cumulative returns
    /// Add one payout's share to a token's returns.
    ///
    /// Counted at most once per payout: returns `false` when `payout_id` was
    /// already applied to this token.
    pub(crate) async fn add_returns_locked(
        &self,
        guard: &KeyGuard,
        token_id: &str,
        payout_id: &str,
        amount: Money,
    ) -> LedgerResult<bool> {
        let mut token = self.token(token_id).await?;
        guard.ensure_covers(&token.asset_id)?;
        if amount.is_negative() {
            return Err(LedgerError::InvariantViolation(format!(
                "Returns on token {} cannot decrease",
                token_id
            )));
        }
        if token.credited_payouts.iter().any(|p| p == payout_id) {
            debug!(token_id, payout_id, "returns already recorded for payout");
            return Ok(false);
        }

        token.total_returns = token.total_returns.checked_add(amount)?;
        token.credited_payouts.push(payout_id.to_string());
        self.storage.update_token(&token).await?;
        Ok(true)
    }

    /// Consistent snapshot of the active tokens of an asset
    pub async fn tokens_for(&self, asset_id: &str) -> LedgerResult<Vec<OwnershipToken>> {
        let guard = self.lock_asset(asset_id).await?;
        self.tokens_for_locked(&guard, asset_id).await
    }

    pub(crate) async fn tokens_for_locked(
        &self,
        guard: &KeyGuard,
        asset_id: &str,
    ) -> LedgerResult<Vec<OwnershipToken>> {
        guard.ensure_covers(asset_id)?;
        let mut tokens: Vec<OwnershipToken> = self
            .storage
            .list_tokens_for_asset(asset_id)
            .await?
            .into_iter()
            .filter(|t| t.is_active())
            .collect();
        tokens.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tokens)
    }

    /// All tokens (active and burned) held by an owner
    pub async fn tokens_for_owner(&self, owner_id: &str) -> LedgerResult<Vec<OwnershipToken>> {
        let mut tokens = self.storage.list_tokens_for_owner(owner_id).await?;
        tokens.sort_by(|a, b| a.minted_at.cmp(&b.minted_at).then(a.id.cmp(&b.id)));
        Ok(tokens)
    }

    /// Apply a valuation from the asset-management feed
    pub async fn update_valuation(&self, asset_id: &str, current_value: Money) -> LedgerResult<Asset> {
        let _guard = self.lock_asset(asset_id).await?;
        let mut asset = self.asset(asset_id).await?;
        self.validator.validate_valuation(&asset, current_value)?;

        let previous = asset.current_value;
        asset.current_value = current_value;
        asset.touch();
        self.storage.update_asset(&asset).await?;
        info!(asset_id, %previous, current = %current_value, "asset revalued");
        Ok(asset)
    }

    /// Take an asset out of service; existing tokens keep earning
    pub async fn retire_asset(&self, asset_id: &str) -> LedgerResult<Asset> {
        let _guard = self.lock_asset(asset_id).await?;
        let mut asset = self.asset(asset_id).await?;
        if asset.status != AssetStatus::Retired {
            asset.status = AssetStatus::Retired;
            asset.touch();
            self.storage.update_asset(&asset).await?;
            info!(asset_id, "asset retired");
        }
        Ok(asset)
    }

    /// Compare an asset's sold fraction with the sum of its active tokens
    pub async fn verify_allocation(&self, asset_id: &str) -> LedgerResult<AllocationCheck> {
        let guard = self.lock_asset(asset_id).await?;
        let asset = self.asset(asset_id).await?;
        let tokens = self.tokens_for_locked(&guard, asset_id).await?;
        let active_token_total = active_fraction_total(&tokens)?;

        Ok(AllocationCheck {
            asset_id: asset.id,
            recorded_sold: asset.total_ownership_sold,
            active_token_total,
            is_consistent: active_token_total == asset.total_ownership_sold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::policy::DistributionPolicy;
    use crate::utils::memory_storage::MemoryStorage;

    async fn ledger_with_asset(sold_major: i64) -> (OwnershipLedger<MemoryStorage>, Asset) {
        let storage = MemoryStorage::new();
        storage
            .save_policy(&DistributionPolicy::vehicle().unwrap())
            .await
            .unwrap();
        let ledger = OwnershipLedger::new(storage);
        let asset = ledger
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

        if sold_major > 0 {
            let fraction = Percentage::from_bps((sold_major / 10) as u32).unwrap();
            ledger
                .reserve_fraction(&asset.id, fraction, "seed-investor", Money::from_major(sold_major).unwrap())
                .await
                .unwrap();
        }
        (ledger, asset)
    }

    #[tokio::test]
    async fn test_reserve_increments_sold_fraction() {
        let (ledger, asset) = ledger_with_asset(60_000).await;

        let token = ledger
            .reserve_fraction(
                &asset.id,
                Percentage::from_whole(10).unwrap(),
                "investor-1",
                Money::from_major(10_000).unwrap(),
            )
            .await
            .unwrap();

        assert!(token.is_active());
        let asset = ledger.asset(&asset.id).await.unwrap();
        assert_eq!(asset.ownership_remaining(), Percentage::from_whole(30).unwrap());
        assert!(ledger.verify_allocation(&asset.id).await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_overallocation_is_rejected_without_state_change() {
        let (ledger, asset) = ledger_with_asset(70_000).await;

        let err = ledger
            .reserve_fraction(
                &asset.id,
                Percentage::from_whole(35).unwrap(),
                "investor-2",
                Money::from_major(35_000).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OwnershipError::Overallocated { .. }));

        let asset = ledger.asset(&asset.id).await.unwrap();
        assert_eq!(asset.total_ownership_sold, Percentage::from_whole(70).unwrap());
        assert_eq!(ledger.tokens_for(&asset.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_below_min_investment() {
        let (ledger, asset) = ledger_with_asset(0).await;
        let err = ledger
            .reserve_fraction(
                &asset.id,
                Percentage::from_bps(50).unwrap(),
                "investor-1",
                Money::from_major(500).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OwnershipError::BelowMinInvestment { .. }));
    }

    #[tokio::test]
    async fn test_full_allocation_flips_status_and_release_reopens() {
        let (ledger, asset) = ledger_with_asset(60_000).await;

        let token = ledger
            .reserve_fraction(
                &asset.id,
                Percentage::from_whole(40).unwrap(),
                "investor-1",
                Money::from_major(40_000).unwrap(),
            )
            .await
            .unwrap();
        let full = ledger.asset(&asset.id).await.unwrap();
        assert_eq!(full.status, AssetStatus::FullyAllocated);

        let err = ledger
            .reserve_fraction(
                &asset.id,
                Percentage::from_whole(1).unwrap(),
                "investor-2",
                Money::from_major(1_000).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OwnershipError::AssetUnavailable { .. }));

        let guard = ledger.lock_asset(&asset.id).await.unwrap();
        ledger.release_fraction_locked(&guard, &token.id).await.unwrap();
        // second release is a no-op
        ledger.release_fraction_locked(&guard, &token.id).await.unwrap();
        drop(guard);

        let reopened = ledger.asset(&asset.id).await.unwrap();
        assert_eq!(reopened.status, AssetStatus::Available);
        assert_eq!(reopened.total_ownership_sold, Percentage::from_whole(60).unwrap());
        assert_eq!(
            ledger.token(&token.id).await.unwrap().status,
            TokenStatus::Burned
        );
    }

    #[tokio::test]
    async fn test_release_fraction_is_idempotent() {
        let (ledger, asset) = ledger_with_asset(30_000).await;
        let token = ledger.tokens_for(&asset.id).await.unwrap().remove(0);

        ledger.release_fraction(&token.id).await.unwrap();
        ledger.release_fraction(&token.id).await.unwrap();

        let asset = ledger.asset(&asset.id).await.unwrap();
        assert_eq!(asset.total_ownership_sold, Percentage::ZERO);
        assert!(ledger.verify_allocation(&asset.id).await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_wrong_guard_is_refused() {
        let (ledger, asset) = ledger_with_asset(0).await;
        let guard = ledger.lock_asset("some-other-asset").await.unwrap();
        let err = ledger
            .reserve_fraction_locked(
                &guard,
                new_id(),
                &asset.id,
                Percentage::from_whole(5).unwrap(),
                "investor-1",
                Money::from_major(5_000).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OwnershipError::Ledger(LedgerError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_retired_asset_is_unavailable() {
        let (ledger, asset) = ledger_with_asset(0).await;
        ledger.retire_asset(&asset.id).await.unwrap();

        let err = ledger
            .reserve_fraction(
                &asset.id,
                Percentage::from_whole(5).unwrap(),
                "investor-1",
                Money::from_major(5_000).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OwnershipError::AssetUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_register_requires_known_policy() {
        let ledger = OwnershipLedger::new(MemoryStorage::new());
        let err = ledger
            .register_asset(NewAsset {
                id: "battery-01".to_string(),
                name: "Battery 01".to_string(),
                asset_type: AssetType::Battery,
                current_value: Money::from_major(5_000).unwrap(),
                min_investment: Money::from_major(100).unwrap(),
                revenue_policy_id: "missing".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OwnershipError::Ledger(LedgerError::PolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_asset_id_must_be_purchasable() {
        let (ledger, _) = ledger_with_asset(0).await;
        let err = ledger
            .register_asset(NewAsset {
                id: "keke.02".to_string(),
                name: "Keke 02".to_string(),
                asset_type: AssetType::Vehicle,
                current_value: Money::from_major(100_000).unwrap(),
                min_investment: Money::from_major(1_000).unwrap(),
                revenue_policy_id: "vehicle".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OwnershipError::Ledger(LedgerError::Validation(_))));
        assert_eq!(ledger.list_assets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_returns_counted_once_per_payout() {
        let (ledger, asset) = ledger_with_asset(30_000).await;
        let token = ledger.tokens_for(&asset.id).await.unwrap().remove(0);
        let share = Money::from_major(1_650).unwrap();

        let guard = ledger.lock_asset(&asset.id).await.unwrap();
        assert!(ledger
            .add_returns_locked(&guard, &token.id, "payout-1", share)
            .await
            .unwrap());
        assert!(!ledger
            .add_returns_locked(&guard, &token.id, "payout-1", share)
            .await
            .unwrap());
        assert!(ledger
            .add_returns_locked(&guard, &token.id, "payout-2", share)
            .await
            .unwrap());
        drop(guard);

        let token = ledger.token(&token.id).await.unwrap();
        assert_eq!(token.total_returns, Money::from_major(3_300).unwrap());
        assert_eq!(token.credited_payouts, vec!["payout-1", "payout-2"]);
    }
}
