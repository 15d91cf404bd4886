//! In-memory storage implementation for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::distribution::policy::DistributionPolicy;
use crate::traits::*;
use crate::types::*;

fn read<T>(lock: &RwLock<T>) -> LedgerResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| LedgerError::Storage("memory storage lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> LedgerResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| LedgerError::Storage("memory storage lock poisoned".to_string()))
}

/// In-memory storage implementation for testing and development
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    wallets: Arc<RwLock<HashMap<String, Wallet>>>,
    wallet_transactions: Arc<RwLock<Vec<WalletTransaction>>>,
    assets: Arc<RwLock<HashMap<String, Asset>>>,
    tokens: Arc<RwLock<HashMap<String, OwnershipToken>>>,
    policies: Arc<RwLock<HashMap<String, DistributionPolicy>>>,
    payouts: Arc<RwLock<HashMap<String, Payout>>>,
    purchases: Arc<RwLock<HashMap<String, PurchaseRecord>>>,
    token_write_failures: Arc<AtomicU32>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` token updates fail with a storage error.
    /// Used to exercise retry paths.
    pub fn fail_next_token_writes(&self, count: u32) {
        self.token_write_failures.store(count, Ordering::SeqCst);
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) -> LedgerResult<()> {
        write(&self.wallets)?.clear();
        write(&self.wallet_transactions)?.clear();
        write(&self.assets)?.clear();
        write(&self.tokens)?.clear();
        write(&self.policies)?.clear();
        write(&self.payouts)?.clear();
        write(&self.purchases)?.clear();
        Ok(())
    }

    fn take_injected_token_failure(&self) -> bool {
        self.token_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn save_wallet(&self, wallet: &Wallet) -> LedgerResult<()> {
        let mut wallets = write(&self.wallets)?;
        if wallets.values().any(|w| w.owner_id == wallet.owner_id) {
            return Err(LedgerError::Duplicate(format!(
                "wallet for owner '{}'",
                wallet.owner_id
            )));
        }
        wallets.insert(wallet.id.clone(), wallet.clone());
        Ok(())
    }

    async fn get_wallet(&self, wallet_id: &str) -> LedgerResult<Option<Wallet>> {
        Ok(read(&self.wallets)?.get(wallet_id).cloned())
    }

    async fn get_wallet_by_owner(&self, owner_id: &str) -> LedgerResult<Option<Wallet>> {
        Ok(read(&self.wallets)?
            .values()
            .find(|w| w.owner_id == owner_id)
            .cloned())
    }

    async fn update_wallet(&self, wallet: &Wallet) -> LedgerResult<()> {
        let mut wallets = write(&self.wallets)?;
        match wallets.get_mut(&wallet.id) {
            Some(existing) => {
                *existing = wallet.clone();
                Ok(())
            }
            None => Err(LedgerError::WalletNotFound(wallet.id.clone())),
        }
    }

    async fn list_wallets(&self) -> LedgerResult<Vec<Wallet>> {
        Ok(read(&self.wallets)?.values().cloned().collect())
    }

    async fn save_wallet_transaction(&self, transaction: &WalletTransaction) -> LedgerResult<()> {
        write(&self.wallet_transactions)?.push(transaction.clone());
        Ok(())
    }

    async fn update_wallet_transaction(
        &self,
        transaction: &WalletTransaction,
    ) -> LedgerResult<()> {
        let mut log = write(&self.wallet_transactions)?;
        match log.iter_mut().find(|t| t.id == transaction.id) {
            Some(existing) => {
                *existing = transaction.clone();
                Ok(())
            }
            None => Err(LedgerError::Storage(format!(
                "wallet transaction '{}' not found",
                transaction.id
            ))),
        }
    }

    async fn get_wallet_transaction(
        &self,
        transaction_id: &str,
    ) -> LedgerResult<Option<WalletTransaction>> {
        Ok(read(&self.wallet_transactions)?
            .iter()
            .find(|t| t.id == transaction_id)
            .cloned())
    }

    async fn find_wallet_transaction(
        &self,
        wallet_id: &str,
        reference: &str,
    ) -> LedgerResult<Option<WalletTransaction>> {
        Ok(read(&self.wallet_transactions)?
            .iter()
            .rev()
            .find(|t| t.wallet_id == wallet_id && t.reference == reference)
            .cloned())
    }

    async fn list_wallet_transactions(
        &self,
        wallet_id: &str,
    ) -> LedgerResult<Vec<WalletTransaction>> {
        Ok(read(&self.wallet_transactions)?
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn save_asset(&self, asset: &Asset) -> LedgerResult<()> {
        let mut assets = write(&self.assets)?;
        if assets.contains_key(&asset.id) {
            return Err(LedgerError::Duplicate(format!("asset '{}'", asset.id)));
        }
        assets.insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn get_asset(&self, asset_id: &str) -> LedgerResult<Option<Asset>> {
        Ok(read(&self.assets)?.get(asset_id).cloned())
    }

    async fn update_asset(&self, asset: &Asset) -> LedgerResult<()> {
        let mut assets = write(&self.assets)?;
        match assets.get_mut(&asset.id) {
            Some(existing) => {
                *existing = asset.clone();
                Ok(())
            }
            None => Err(LedgerError::AssetNotFound(asset.id.clone())),
        }
    }

    async fn list_assets(&self) -> LedgerResult<Vec<Asset>> {
        Ok(read(&self.assets)?.values().cloned().collect())
    }

    async fn save_token(&self, token: &OwnershipToken) -> LedgerResult<()> {
        let mut tokens = write(&self.tokens)?;
        if tokens.contains_key(&token.id) {
            return Err(LedgerError::Duplicate(format!("token '{}'", token.id)));
        }
        tokens.insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> LedgerResult<Option<OwnershipToken>> {
        Ok(read(&self.tokens)?.get(token_id).cloned())
    }

    async fn update_token(&self, token: &OwnershipToken) -> LedgerResult<()> {
        if self.take_injected_token_failure() {
            return Err(LedgerError::Storage(format!(
                "injected write failure for token '{}'",
                token.id
            )));
        }

        let mut tokens = write(&self.tokens)?;
        match tokens.get_mut(&token.id) {
            Some(existing) => {
                *existing = token.clone();
                Ok(())
            }
            None => Err(LedgerError::TokenNotFound(token.id.clone())),
        }
    }

    async fn list_tokens_for_asset(&self, asset_id: &str) -> LedgerResult<Vec<OwnershipToken>> {
        Ok(read(&self.tokens)?
            .values()
            .filter(|t| t.asset_id == asset_id)
            .cloned()
            .collect())
    }

    async fn list_tokens_for_owner(&self, owner_id: &str) -> LedgerResult<Vec<OwnershipToken>> {
        Ok(read(&self.tokens)?
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn save_policy(&self, policy: &DistributionPolicy) -> LedgerResult<()> {
        let mut policies = write(&self.policies)?;
        if policies.contains_key(&policy.id) {
            return Err(LedgerError::Duplicate(format!("policy '{}'", policy.id)));
        }
        policies.insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    async fn get_policy(&self, policy_id: &str) -> LedgerResult<Option<DistributionPolicy>> {
        Ok(read(&self.policies)?.get(policy_id).cloned())
    }

    async fn list_policies(&self) -> LedgerResult<Vec<DistributionPolicy>> {
        Ok(read(&self.policies)?.values().cloned().collect())
    }

    async fn save_payout(&self, payout: &Payout) -> LedgerResult<()> {
        let mut payouts = write(&self.payouts)?;
        if payouts
            .values()
            .any(|p| p.asset_id == payout.asset_id && p.period == payout.period)
        {
            return Err(LedgerError::Duplicate(format!(
                "payout for asset '{}' period '{}'",
                payout.asset_id, payout.period
            )));
        }
        payouts.insert(payout.id.clone(), payout.clone());
        Ok(())
    }

    async fn update_payout(&self, payout: &Payout) -> LedgerResult<()> {
        let mut payouts = write(&self.payouts)?;
        match payouts.get_mut(&payout.id) {
            Some(existing) => {
                *existing = payout.clone();
                Ok(())
            }
            None => Err(LedgerError::PayoutNotFound(payout.id.clone())),
        }
    }

    async fn get_payout(&self, payout_id: &str) -> LedgerResult<Option<Payout>> {
        Ok(read(&self.payouts)?.get(payout_id).cloned())
    }

    async fn find_payout(&self, asset_id: &str, period: &str) -> LedgerResult<Option<Payout>> {
        Ok(read(&self.payouts)?
            .values()
            .find(|p| p.asset_id == asset_id && p.period == period)
            .cloned())
    }

    async fn list_payouts_for_asset(&self, asset_id: &str) -> LedgerResult<Vec<Payout>> {
        let mut payouts: Vec<Payout> = read(&self.payouts)?
            .values()
            .filter(|p| p.asset_id == asset_id)
            .cloned()
            .collect();
        payouts.sort_by(|a, b| a.period.cmp(&b.period));
        Ok(payouts)
    }

    async fn save_purchase(&self, purchase: &PurchaseRecord) -> LedgerResult<()> {
        write(&self.purchases)?.insert(purchase.idempotency_key.clone(), purchase.clone());
        Ok(())
    }

    async fn get_purchase(&self, idempotency_key: &str) -> LedgerResult<Option<PurchaseRecord>> {
        Ok(read(&self.purchases)?.get(idempotency_key).cloned())
    }

    async fn list_purchases(&self) -> LedgerResult<Vec<PurchaseRecord>> {
        Ok(read(&self.purchases)?.values().cloned().collect())
    }
}
