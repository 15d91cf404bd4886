//! Traits for storage abstraction and extensibility

use async_trait::async_trait;

use crate::distribution::policy::DistributionPolicy;
use crate::types::*;
use crate::utils::validation::validate_identifier;

/// Storage abstraction for the ledger system
///
/// This trait allows the ledger core to work with any storage backend
/// (PostgreSQL, SQLite, in-memory, etc.) by implementing these methods.
/// Implementations must make each individual call atomic; multi-record
/// consistency is provided by the per-asset and per-wallet locks held by
/// the callers.
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Save a new wallet
    async fn save_wallet(&self, wallet: &Wallet) -> LedgerResult<()>;

    /// Get a wallet by ID
    async fn get_wallet(&self, wallet_id: &str) -> LedgerResult<Option<Wallet>>;

    /// Get the wallet belonging to an owner
    async fn get_wallet_by_owner(&self, owner_id: &str) -> LedgerResult<Option<Wallet>>;

    /// Update an existing wallet
    async fn update_wallet(&self, wallet: &Wallet) -> LedgerResult<()>;

    /// List all wallets
    async fn list_wallets(&self) -> LedgerResult<Vec<Wallet>>;

    /// Append a wallet transaction to the log
    async fn save_wallet_transaction(&self, transaction: &WalletTransaction) -> LedgerResult<()>;

    /// Update the status of a logged wallet transaction
    async fn update_wallet_transaction(&self, transaction: &WalletTransaction)
        -> LedgerResult<()>;

    /// Get a wallet transaction by ID
    async fn get_wallet_transaction(
        &self,
        transaction_id: &str,
    ) -> LedgerResult<Option<WalletTransaction>>;

    /// Most recent transaction carrying `reference` for a wallet
    async fn find_wallet_transaction(
        &self,
        wallet_id: &str,
        reference: &str,
    ) -> LedgerResult<Option<WalletTransaction>>;

    /// All transactions of a wallet in the order they were appended
    async fn list_wallet_transactions(&self, wallet_id: &str)
        -> LedgerResult<Vec<WalletTransaction>>;

    /// Save a new asset
    async fn save_asset(&self, asset: &Asset) -> LedgerResult<()>;

    /// Get an asset by ID
    async fn get_asset(&self, asset_id: &str) -> LedgerResult<Option<Asset>>;

    /// Update an existing asset
    async fn update_asset(&self, asset: &Asset) -> LedgerResult<()>;

    /// List all assets
    async fn list_assets(&self) -> LedgerResult<Vec<Asset>>;

    /// Save a newly minted ownership token
    async fn save_token(&self, token: &OwnershipToken) -> LedgerResult<()>;

    /// Get an ownership token by ID
    async fn get_token(&self, token_id: &str) -> LedgerResult<Option<OwnershipToken>>;

    /// Update an existing ownership token
    async fn update_token(&self, token: &OwnershipToken) -> LedgerResult<()>;

    /// All tokens (active and burned) for an asset
    async fn list_tokens_for_asset(&self, asset_id: &str) -> LedgerResult<Vec<OwnershipToken>>;

    /// All tokens (active and burned) held by an owner
    async fn list_tokens_for_owner(&self, owner_id: &str) -> LedgerResult<Vec<OwnershipToken>>;

    /// Save a distribution policy
    async fn save_policy(&self, policy: &DistributionPolicy) -> LedgerResult<()>;

    /// Get a distribution policy by ID
    async fn get_policy(&self, policy_id: &str) -> LedgerResult<Option<DistributionPolicy>>;

    /// List all distribution policies
    async fn list_policies(&self) -> LedgerResult<Vec<DistributionPolicy>>;

    /// Save a new payout
    async fn save_payout(&self, payout: &Payout) -> LedgerResult<()>;

    /// Update an existing payout
    async fn update_payout(&self, payout: &Payout) -> LedgerResult<()>;

    /// Get a payout by ID
    async fn get_payout(&self, payout_id: &str) -> LedgerResult<Option<Payout>>;

    /// Get the payout for an asset and period, if one exists
    async fn find_payout(&self, asset_id: &str, period: &str) -> LedgerResult<Option<Payout>>;

    /// All payouts for an asset
    async fn list_payouts_for_asset(&self, asset_id: &str) -> LedgerResult<Vec<Payout>>;

    /// Insert or replace the purchase record for its idempotency key
    async fn save_purchase(&self, purchase: &PurchaseRecord) -> LedgerResult<()>;

    /// Get the purchase record for an idempotency key
    async fn get_purchase(&self, idempotency_key: &str) -> LedgerResult<Option<PurchaseRecord>>;

    /// List all purchase records
    async fn list_purchases(&self) -> LedgerResult<Vec<PurchaseRecord>>;
}

/// Trait for implementing custom asset validation rules
pub trait AssetValidator: Send + Sync {
    /// Validate an asset before it is registered
    fn validate_asset(&self, asset: &Asset) -> LedgerResult<()>;

    /// Validate a valuation update from the asset-management feed
    fn validate_valuation(&self, asset: &Asset, new_value: crate::money::Money)
        -> LedgerResult<()>;
}

/// Default asset validator with basic rules
pub struct DefaultAssetValidator;

impl AssetValidator for DefaultAssetValidator {
    fn validate_asset(&self, asset: &Asset) -> LedgerResult<()> {
        validate_identifier("Asset ID", &asset.id)?;

        if !asset.current_value.is_positive() {
            return Err(LedgerError::Validation(
                "Asset value must be positive".to_string(),
            ));
        }

        if !asset.min_investment.is_positive() || asset.min_investment > asset.current_value {
            return Err(LedgerError::Validation(format!(
                "Minimum investment {} must be positive and no more than the asset value {}",
                asset.min_investment, asset.current_value
            )));
        }

        Ok(())
    }

    fn validate_valuation(
        &self,
        _asset: &Asset,
        new_value: crate::money::Money,
    ) -> LedgerResult<()> {
        if !new_value.is_positive() {
            return Err(LedgerError::Validation(
                "Asset value must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
