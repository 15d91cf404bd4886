//! Main ledger facade that wires the wallet ledger, ownership ledger,
//! purchase orchestrator and distribution engine over one storage backend

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::distribution::engine::{DistributionError, RevenueDistributor};
use crate::distribution::policy::DistributionPolicy;
use crate::ledger::ownership::{AllocationCheck, NewAsset, OwnershipError, OwnershipLedger};
use crate::ledger::wallet::{TransferReceipt, WalletError, WalletLedger, WalletReconciliation};
use crate::money::Money;
use crate::purchase::{PurchaseError, PurchaseOrchestrator, PurchaseRequest, RecoveryReport};
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::validate_identifier;

/// One line of an investor's portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub token: OwnershipToken,
    pub asset_name: String,
    pub asset_value: Money,
    /// The asset's current value times the token's fraction
    pub position_value: Money,
    /// Cumulative returns over the amount invested, in percent
    pub roi: BigDecimal,
}

/// Result of a full consistency sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub allocations: Vec<AllocationCheck>,
    pub wallets: Vec<WalletReconciliation>,
    /// Idempotency keys of purchases that have not reached a terminal state
    pub incomplete_purchases: Vec<String>,
    /// Payout ids with at least one failed credit
    pub partial_payouts: Vec<String>,
}

/// Return on investment in percent with two decimal places
pub fn roi_percent(total_returns: Money, investment: Money) -> LedgerResult<BigDecimal> {
    let bps = total_returns.ratio_bps(investment)?;
    Ok(BigDecimal::new(bps.into(), 2))
}

/// Main entry point of the fractional-ownership ledger
pub struct FractionalLedger<S: LedgerStorage> {
    storage: S,
    config: LedgerConfig,
    wallets: Arc<WalletLedger<S>>,
    ownership: Arc<OwnershipLedger<S>>,
    purchases: PurchaseOrchestrator<S>,
    distributor: RevenueDistributor<S>,
}

impl<S: LedgerStorage + Clone> FractionalLedger<S> {
    /// Create a ledger with the default configuration. No policies are seeded.
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, LedgerConfig::default())
    }

    pub fn with_config(storage: S, config: LedgerConfig) -> Self {
        let ownership = Arc::new(OwnershipLedger::new(storage.clone()));
        Self::assemble(storage, config, ownership)
    }

    /// Create a ledger with a custom asset validator
    pub fn with_validator(
        storage: S,
        config: LedgerConfig,
        validator: Box<dyn AssetValidator>,
    ) -> Self {
        let ownership = Arc::new(OwnershipLedger::with_validator(storage.clone(), validator));
        Self::assemble(storage, config, ownership)
    }

    /// Validate the configuration, build the ledger and seed the built-in
    /// policies when configured to
    pub async fn bootstrap(storage: S, config: LedgerConfig) -> LedgerResult<Self> {
        config.validate()?;
        let ledger = Self::with_config(storage, config);
        if ledger.config.register_builtin_policies {
            ledger.register_builtin_policies().await?;
        }
        Ok(ledger)
    }

    fn assemble(storage: S, config: LedgerConfig, ownership: Arc<OwnershipLedger<S>>) -> Self {
        let wallets = Arc::new(WalletLedger::new(storage.clone()));
        let purchases = PurchaseOrchestrator::new(
            storage.clone(),
            ownership.clone(),
            wallets.clone(),
            config.compensation.clone(),
        );
        let distributor = RevenueDistributor::new(storage.clone(), ownership.clone(), wallets.clone());

        Self {
            storage,
            config,
            wallets,
            ownership,
            purchases,
            distributor,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn wallets(&self) -> &WalletLedger<S> {
        &self.wallets
    }

    pub fn ownership(&self) -> &OwnershipLedger<S> {
        &self.ownership
    }

    // Policy operations
    /// Register a distribution policy
    pub async fn register_policy(&self, policy: DistributionPolicy) -> LedgerResult<()> {
        validate_identifier("Policy ID", &policy.id)?;
        policy.validate()?;
        self.storage.save_policy(&policy).await?;
        info!(policy_id = %policy.id, tiers = policy.tiers.len(), "distribution policy registered");
        Ok(())
    }

    /// Seed the `vehicle` and `swap_station` policies if they are missing
    pub async fn register_builtin_policies(&self) -> LedgerResult<()> {
        for policy in [DistributionPolicy::vehicle()?, DistributionPolicy::swap_station()?] {
            if self.storage.get_policy(&policy.id).await?.is_none() {
                self.register_policy(policy).await?;
            }
        }
        Ok(())
    }

    pub async fn policy(&self, policy_id: &str) -> LedgerResult<DistributionPolicy> {
        self.storage
            .get_policy(policy_id)
            .await?
            .ok_or_else(|| LedgerError::PolicyNotFound(policy_id.to_string()))
    }

    pub async fn list_policies(&self) -> LedgerResult<Vec<DistributionPolicy>> {
        self.storage.list_policies().await
    }

    // Asset operations
    pub async fn register_asset(&self, new_asset: NewAsset) -> Result<Asset, OwnershipError> {
        self.ownership.register_asset(new_asset).await
    }

    pub async fn asset(&self, asset_id: &str) -> LedgerResult<Asset> {
        self.ownership.asset(asset_id).await
    }

    pub async fn list_assets(&self) -> LedgerResult<Vec<Asset>> {
        self.ownership.list_assets().await
    }

    pub async fn update_valuation(&self, asset_id: &str, current_value: Money) -> LedgerResult<Asset> {
        self.ownership.update_valuation(asset_id, current_value).await
    }

    pub async fn retire_asset(&self, asset_id: &str) -> LedgerResult<Asset> {
        self.ownership.retire_asset(asset_id).await
    }

    pub async fn burn_token(&self, token_id: &str) -> LedgerResult<OwnershipToken> {
        self.ownership.burn_token(token_id).await
    }

    /// Active tokens of an asset, from a consistent snapshot
    pub async fn tokens_for(&self, asset_id: &str) -> LedgerResult<Vec<OwnershipToken>> {
        self.ownership.tokens_for(asset_id).await
    }

    // Wallet operations
    pub async fn open_wallet(&self, owner_id: &str) -> Result<Wallet, WalletError> {
        self.wallets.open_wallet(owner_id).await
    }

    pub async fn wallet_for_owner(&self, owner_id: &str) -> Result<Wallet, WalletError> {
        self.wallets.wallet_for_owner(owner_id).await
    }

    pub async fn suspend_wallet(&self, wallet_id: &str) -> Result<Wallet, WalletError> {
        self.wallets.suspend_wallet(wallet_id).await
    }

    pub async fn activate_wallet(&self, wallet_id: &str) -> Result<Wallet, WalletError> {
        self.wallets.activate_wallet(wallet_id).await
    }

    /// Record a gateway-verified deposit
    pub async fn deposit(
        &self,
        wallet_id: &str,
        amount: Money,
        fee: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        self.wallets.record_deposit(wallet_id, amount, fee, reference).await
    }

    /// Record a gateway-verified withdrawal
    pub async fn withdraw(
        &self,
        wallet_id: &str,
        amount: Money,
        fee: Money,
        reference: &str,
    ) -> Result<String, WalletError> {
        self.wallets.record_withdrawal(wallet_id, amount, fee, reference).await
    }

    pub async fn transfer(
        &self,
        from_wallet_id: &str,
        to_wallet_id: &str,
        amount: Money,
        reference: &str,
    ) -> Result<TransferReceipt, WalletError> {
        self.wallets
            .transfer(from_wallet_id, to_wallet_id, amount, reference)
            .await
    }

    pub async fn wallet_transactions(&self, wallet_id: &str) -> Result<Vec<WalletTransaction>, WalletError> {
        self.wallets.transactions(wallet_id).await
    }

    /// Balance of an owner's wallet, computed from its transaction log
    pub async fn wallet_balance(&self, owner_id: &str) -> Result<Money, WalletError> {
        let wallet = self.wallets.wallet_for_owner(owner_id).await?;
        self.wallets.balance_of(&wallet.id).await
    }

    // Purchases
    /// Buy a fraction of an asset with funds from the investor's wallet
    pub async fn purchase(
        &self,
        asset_id: &str,
        investor_id: &str,
        amount: Money,
        idempotency_key: &str,
    ) -> Result<OwnershipToken, PurchaseError> {
        self.purchases
            .purchase(PurchaseRequest::new(asset_id, investor_id, amount, idempotency_key))
            .await
    }

    pub async fn purchase_record(&self, idempotency_key: &str) -> LedgerResult<Option<PurchaseRecord>> {
        self.purchases.purchase_record(idempotency_key).await
    }

    pub async fn resume_incomplete_purchases(&self) -> Result<RecoveryReport, PurchaseError> {
        self.purchases.resume_incomplete().await
    }

    // Distribution
    pub async fn distribute(
        &self,
        asset_id: &str,
        period: &str,
        gross_revenue: Money,
    ) -> Result<Payout, DistributionError> {
        self.distributor.distribute(asset_id, period, gross_revenue).await
    }

    pub async fn retry_failed_credit(
        &self,
        payout_id: &str,
        token_id: &str,
    ) -> Result<InvestorAllocation, DistributionError> {
        self.distributor.retry_failed_credit(payout_id, token_id).await
    }

    pub async fn retry_failed_tier_credits(&self, payout_id: &str) -> Result<Payout, DistributionError> {
        self.distributor.retry_failed_tier_credits(payout_id).await
    }

    pub async fn payout(&self, asset_id: &str, period: &str) -> LedgerResult<Option<Payout>> {
        self.distributor.payout(asset_id, period).await
    }

    pub async fn payouts_for_asset(&self, asset_id: &str) -> LedgerResult<Vec<Payout>> {
        self.distributor.payouts_for_asset(asset_id).await
    }

    // Read model
    /// Active positions of an investor with current value and ROI
    pub async fn portfolio(&self, investor_id: &str) -> LedgerResult<Vec<PortfolioPosition>> {
        let mut positions = Vec::new();

        for token in self.ownership.tokens_for_owner(investor_id).await? {
            if !token.is_active() {
                continue;
            }
            let asset = self.ownership.asset(&token.asset_id).await?;
            let position_value = asset.current_value.percent(token.fraction_owned)?;
            let roi = roi_percent(token.total_returns, token.investment_amount)?;

            positions.push(PortfolioPosition {
                asset_name: asset.name,
                asset_value: asset.current_value,
                position_value,
                roi,
                token,
            });
        }

        Ok(positions)
    }

    /// Check every asset's sold fraction and every wallet's cached balance
    /// against the records behind them
    pub async fn validate_integrity(&self) -> LedgerResult<IntegrityReport> {
        let mut issues = Vec::new();

        let mut allocations = Vec::new();
        for asset in self.ownership.list_assets().await? {
            let check = self.ownership.verify_allocation(&asset.id).await?;
            if !check.is_consistent {
                issues.push(format!(
                    "Asset {} records {} sold but its active tokens hold {}",
                    check.asset_id, check.recorded_sold, check.active_token_total
                ));
            }
            allocations.push(check);
        }

        let mut wallets = Vec::new();
        for wallet in self.storage.list_wallets().await? {
            let reconciliation = self.wallets.reconcile(&wallet.id).await.map_err(|err| match err {
                WalletError::Ledger(err) => err,
                other => LedgerError::Storage(other.to_string()),
            })?;
            if !reconciliation.is_consistent {
                issues.push(format!(
                    "Wallet {} caches {} but its log sums to {}",
                    reconciliation.wallet_id, reconciliation.cached_balance, reconciliation.ledger_balance
                ));
            }
            wallets.push(reconciliation);
        }

        let incomplete_purchases: Vec<String> = self
            .storage
            .list_purchases()
            .await?
            .into_iter()
            .filter(|p| !p.state.is_terminal())
            .map(|p| p.idempotency_key)
            .collect();
        for key in &incomplete_purchases {
            issues.push(format!("Purchase '{}' has not reached a terminal state", key));
        }

        let mut partial_payouts = Vec::new();
        for asset in &allocations {
            for payout in self.storage.list_payouts_for_asset(&asset.asset_id).await? {
                if payout.is_partial() {
                    issues.push(format!(
                        "Payout {} for {} has {} failed credit(s)",
                        payout.id,
                        payout.period,
                        payout.failed_allocations().len()
                    ));
                    partial_payouts.push(payout.id);
                }
            }
        }

        let is_valid = issues.is_empty();
        if !is_valid {
            warn!(issues = issues.len(), "ledger integrity check found issues");
        }

        Ok(IntegrityReport {
            is_valid,
            issues,
            allocations,
            wallets,
            incomplete_purchases,
            partial_payouts,
        })
    }
}
