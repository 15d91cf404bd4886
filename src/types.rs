//! Core types and data structures for the fractional-ownership ledger

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::money::{Money, MoneyError, Percentage};

pub(crate) fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Kinds of divisible, revenue-generating assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Vehicle,
    Battery,
    ChargingCabinet,
}

/// Lifecycle of an asset with respect to new purchases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Fractions can still be purchased
    Available,
    /// Every fraction has been sold
    FullyAllocated,
    /// Taken out of service; no further purchases
    Retired,
}

/// A physical asset subdivided into purchasable ownership fractions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub name: String,
    pub asset_type: AssetType,
    /// Current valuation, supplied by the asset-management feed
    pub current_value: Money,
    /// Smallest amount accepted for a single purchase
    pub min_investment: Money,
    /// Sum of the fractions of all active tokens for this asset
    pub total_ownership_sold: Percentage,
    pub status: AssetStatus,
    /// Distribution policy applied to this asset's revenue
    pub revenue_policy_id: String,
    pub metadata: HashMap<String, String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Asset {
    /// Fraction still available for purchase. Always derived, never stored.
    pub fn ownership_remaining(&self) -> Percentage {
        self.total_ownership_sold.complement()
    }

    pub fn is_available(&self) -> bool {
        self.status == AssetStatus::Available
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    /// Ownership term expired, liquidated, or purchase rolled back
    Burned,
}

/// A claim by one investor on a fraction of one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipToken {
    pub id: String,
    pub asset_id: String,
    pub owner_id: String,
    pub fraction_owned: Percentage,
    /// Amount paid for the fraction
    pub investment_amount: Money,
    /// Cumulative payouts received; never decreases
    pub total_returns: Money,
    pub status: TokenStatus,
    pub minted_at: NaiveDateTime,
    pub burned_at: Option<NaiveDateTime>,
    /// Wallet transaction that settled the purchase
    pub settlement_reference: Option<String>,
    /// Payouts already counted in `total_returns`
    #[serde(default)]
    pub credited_payouts: Vec<String>,
}

impl OwnershipToken {
    pub(crate) fn mint(
        id: String,
        asset_id: &str,
        owner_id: &str,
        fraction_owned: Percentage,
        investment_amount: Money,
    ) -> Self {
        Self {
            id,
            asset_id: asset_id.to_string(),
            owner_id: owner_id.to_string(),
            fraction_owned,
            investment_amount,
            total_returns: Money::ZERO,
            status: TokenStatus::Active,
            minted_at: now(),
            burned_at: None,
            settlement_reference: None,
            credited_payouts: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TokenStatus::Active
    }

    pub(crate) fn burn(&mut self) {
        self.status = TokenStatus::Burned;
        self.burned_at = Some(now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Suspended,
}

/// Balance holder for one owner (investor, operator, driver)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub owner_id: String,
    /// Cached balance, reconciled against the transaction log
    pub balance: Money,
    pub status: WalletStatus,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Wallet {
    pub fn new(owner_id: &str) -> Self {
        let now = now();
        Self {
            id: new_id(),
            owner_id: owner_id.to_string(),
            balance: Money::ZERO,
            status: WalletStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }
}

/// Kinds of wallet movements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Investment,
    Payout,
    TransferIn,
    TransferOut,
}

impl TransactionType {
    /// Whether this movement adds to the wallet balance
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Deposit | TransactionType::Payout | TransactionType::TransferIn
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// Append-only wallet log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: String,
    pub wallet_id: String,
    pub transaction_type: TransactionType,
    pub amount: Money,
    pub fee: Money,
    /// Amount actually moved: `amount - fee` for credits, `amount + fee` for debits
    pub net_amount: Money,
    pub status: TransactionStatus,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    /// Idempotency key
    pub reference: String,
    pub failure_reason: Option<String>,
}

impl WalletTransaction {
    pub(crate) fn pending(
        wallet_id: &str,
        transaction_type: TransactionType,
        amount: Money,
        fee: Money,
        net_amount: Money,
        reference: &str,
    ) -> Self {
        Self {
            id: new_id(),
            wallet_id: wallet_id.to_string(),
            transaction_type,
            amount,
            fee,
            net_amount,
            status: TransactionStatus::Pending,
            created_at: now(),
            completed_at: None,
            reference: reference.to_string(),
            failure_reason: None,
        }
    }

    pub(crate) fn complete(&mut self) {
        self.status = TransactionStatus::Completed;
        self.completed_at = Some(now());
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = TransactionStatus::Failed;
        self.failure_reason = Some(reason.into());
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }

    /// Net amount with the sign of its effect on the balance
    pub fn signed_net_amount(&self) -> Result<Money, MoneyError> {
        if self.transaction_type.is_credit() {
            Ok(self.net_amount)
        } else {
            self.net_amount.checked_neg()
        }
    }
}

/// Parties that receive a share of an asset's gross revenue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeholderTier {
    Investor,
    Rider,
    Management,
    Reserve,
    Operations,
    EnergyProvider,
    LoyaltyPool,
}

impl fmt::Display for StakeholderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StakeholderTier::Investor => "investor",
            StakeholderTier::Rider => "rider",
            StakeholderTier::Management => "management",
            StakeholderTier::Reserve => "reserve",
            StakeholderTier::Operations => "operations",
            StakeholderTier::EnergyProvider => "energy_provider",
            StakeholderTier::LoyaltyPool => "loyalty_pool",
        };
        f.write_str(name)
    }
}

/// One tier's slice of a period's gross revenue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAmount {
    pub tier: StakeholderTier,
    pub share: Percentage,
    pub amount: Money,
    /// Owner whose wallet receives this tier, if the policy names one
    pub beneficiary_owner_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    /// Recorded on the payout, wallet not yet credited
    Pending,
    Credited,
    Failed,
    /// Nothing to credit (prorated amount rounded to zero)
    Skipped,
}

/// Prorated payout for one ownership token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestorAllocation {
    pub token_id: String,
    pub owner_id: String,
    pub fraction: Percentage,
    pub amount: Money,
    pub status: CreditStatus,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Credit of a non-investor tier to its beneficiary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierCredit {
    pub tier: StakeholderTier,
    pub owner_id: String,
    pub amount: Money,
    pub status: CreditStatus,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Revenue distribution for one asset and one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub asset_id: String,
    /// Calendar month, `YYYY-MM`
    pub period: String,
    pub policy_id: String,
    pub gross_revenue: Money,
    /// Ordered as in the policy; sums to `gross_revenue`
    pub tier_amounts: Vec<TierAmount>,
    pub investor_pool: Money,
    /// Sum of active fractions at snapshot time
    pub snapshot_fraction: Percentage,
    pub allocations: Vec<InvestorAllocation>,
    pub tier_credits: Vec<TierCredit>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Payout {
    pub fn tier_amount(&self, tier: StakeholderTier) -> Option<Money> {
        self.tier_amounts
            .iter()
            .find(|t| t.tier == tier)
            .map(|t| t.amount)
    }

    pub fn allocation(&self, token_id: &str) -> Option<&InvestorAllocation> {
        self.allocations.iter().find(|a| a.token_id == token_id)
    }

    /// Allocations whose wallet credit did not go through
    pub fn failed_allocations(&self) -> Vec<&InvestorAllocation> {
        self.allocations
            .iter()
            .filter(|a| matches!(a.status, CreditStatus::Failed | CreditStatus::Pending))
            .collect()
    }

    /// True when at least one credit (investor or tier) failed
    pub fn is_partial(&self) -> bool {
        !self.failed_allocations().is_empty()
            || self
                .tier_credits
                .iter()
                .any(|c| matches!(c.status, CreditStatus::Failed | CreditStatus::Pending))
    }
}

/// States of the server-side purchase flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseState {
    Requested,
    Validated,
    Reserved,
    Debited,
    Committed,
    Rejected,
    DebitFailed,
    RolledBack,
}

impl PurchaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PurchaseState::Committed | PurchaseState::Rejected | PurchaseState::RolledBack
        )
    }

    pub fn can_transition_to(&self, next: PurchaseState) -> bool {
        use PurchaseState::*;
        matches!(
            (self, next),
            (Requested, Validated)
                | (Requested, Rejected)
                | (Validated, Reserved)
                | (Validated, Rejected)
                | (Reserved, Debited)
                | (Reserved, DebitFailed)
                | (Debited, Committed)
                | (DebitFailed, RolledBack)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseTransition {
    pub state: PurchaseState,
    pub at: NaiveDateTime,
}

/// Durable record of one purchase attempt, keyed by idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    /// Purchase id; also the minted token id and the debit reference
    pub id: String,
    pub idempotency_key: String,
    pub asset_id: String,
    pub investor_id: String,
    pub amount: Money,
    pub fraction: Option<Percentage>,
    pub token_id: Option<String>,
    pub wallet_id: Option<String>,
    pub debit_transaction_id: Option<String>,
    pub state: PurchaseState,
    pub failure_reason: Option<String>,
    pub history: Vec<PurchaseTransition>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl PurchaseRecord {
    pub fn new(idempotency_key: &str, asset_id: &str, investor_id: &str, amount: Money) -> Self {
        let now = now();
        Self {
            id: new_id(),
            idempotency_key: idempotency_key.to_string(),
            asset_id: asset_id.to_string(),
            investor_id: investor_id.to_string(),
            amount,
            fraction: None,
            token_id: None,
            wallet_id: None,
            debit_transaction_id: None,
            state: PurchaseState::Requested,
            failure_reason: None,
            history: vec![PurchaseTransition {
                state: PurchaseState::Requested,
                at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn transition(&mut self, next: PurchaseState) -> LedgerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(LedgerError::InvariantViolation(format!(
                "Purchase {} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        let now = now();
        self.state = next;
        self.history.push(PurchaseTransition { state: next, at: now });
        self.updated_at = now;
        Ok(())
    }

    /// Whether a replayed request carries the same parameters
    pub fn matches(&self, asset_id: &str, investor_id: &str, amount: Money) -> bool {
        self.asset_id == asset_id && self.investor_id == investor_id && self.amount == amount
    }
}

/// Errors that can occur in the ledger system
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Asset not found: {0}")]
    AssetNotFound(String),
    #[error("Ownership token not found: {0}")]
    TokenNotFound(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Distribution policy not found: {0}")]
    PolicyNotFound(String),
    #[error("Payout not found: {0}")]
    PayoutNotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Monetary error: {0}")]
    Money(#[from] MoneyError),
    #[error("Ledger invariant violated: {0}")]
    InvariantViolation(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_state_machine() {
        let mut record = PurchaseRecord::new("key-1", "asset-1", "investor-1", Money::from_minor(100));
        assert_eq!(record.state, PurchaseState::Requested);

        record.transition(PurchaseState::Validated).unwrap();
        record.transition(PurchaseState::Reserved).unwrap();
        assert!(record.transition(PurchaseState::Committed).is_err());
        record.transition(PurchaseState::DebitFailed).unwrap();
        record.transition(PurchaseState::RolledBack).unwrap();

        assert!(record.state.is_terminal());
        assert_eq!(record.history.len(), 5);
    }

    #[test]
    fn test_signed_net_amount() {
        let credit = WalletTransaction::pending(
            "w1",
            TransactionType::Payout,
            Money::from_minor(500),
            Money::ZERO,
            Money::from_minor(500),
            "ref",
        );
        let debit = WalletTransaction::pending(
            "w1",
            TransactionType::Investment,
            Money::from_minor(500),
            Money::ZERO,
            Money::from_minor(500),
            "ref-2",
        );
        assert_eq!(credit.signed_net_amount().unwrap(), Money::from_minor(500));
        assert_eq!(debit.signed_net_amount().unwrap(), Money::from_minor(-500));
    }

    #[test]
    fn test_asset_remaining_is_derived() {
        let now = now();
        let asset = Asset {
            id: "a1".to_string(),
            name: "Keke 01".to_string(),
            asset_type: AssetType::Vehicle,
            current_value: Money::from_minor(1_000_000),
            min_investment: Money::from_minor(10_000),
            total_ownership_sold: Percentage::from_whole(60).unwrap(),
            status: AssetStatus::Available,
            revenue_policy_id: "vehicle".to_string(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(asset.ownership_remaining(), Percentage::from_whole(40).unwrap());
    }
}
