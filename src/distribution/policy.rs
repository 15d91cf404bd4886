//! Stakeholder split policies applied to an asset's gross revenue

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::money::{Money, Percentage};
use crate::types::*;

pub const VEHICLE_POLICY_ID: &str = "vehicle";
pub const SWAP_STATION_POLICY_ID: &str = "swap_station";

/// One entry of a distribution policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTier {
    pub tier: StakeholderTier,
    pub share: Percentage,
    /// Owner credited with this tier's amount; the investor tier never has one
    pub beneficiary_owner_id: Option<String>,
}

impl PolicyTier {
    pub fn new(tier: StakeholderTier, share: Percentage) -> Self {
        Self {
            tier,
            share,
            beneficiary_owner_id: None,
        }
    }

    pub fn with_beneficiary(mut self, owner_id: impl Into<String>) -> Self {
        self.beneficiary_owner_id = Some(owner_id.into());
        self
    }
}

/// Ordered list of stakeholder tiers whose shares sum to exactly 100%
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionPolicy {
    pub id: String,
    pub name: String,
    pub tiers: Vec<PolicyTier>,
}

impl DistributionPolicy {
    /// Create a policy, validating its tiers
    pub fn new(id: String, name: String, tiers: Vec<PolicyTier>) -> LedgerResult<Self> {
        let policy = Self { id, name, tiers };
        policy.validate()?;
        Ok(policy)
    }

    /// Vehicle revenue: 50% investors, 25% rider, 20% management, 5% reserve
    pub fn vehicle() -> LedgerResult<Self> {
        Self::new(
            VEHICLE_POLICY_ID.to_string(),
            "Vehicle revenue split".to_string(),
            vec![
                PolicyTier::new(StakeholderTier::Investor, Percentage::from_whole(50)?),
                PolicyTier::new(StakeholderTier::Rider, Percentage::from_whole(25)?),
                PolicyTier::new(StakeholderTier::Management, Percentage::from_whole(20)?),
                PolicyTier::new(StakeholderTier::Reserve, Percentage::from_whole(5)?),
            ],
        )
    }

    /// Swap-station revenue: 60% investors, 25% operations, 10% energy, 5% loyalty
    pub fn swap_station() -> LedgerResult<Self> {
        Self::new(
            SWAP_STATION_POLICY_ID.to_string(),
            "Battery swap-station revenue split".to_string(),
            vec![
                PolicyTier::new(StakeholderTier::Investor, Percentage::from_whole(60)?),
                PolicyTier::new(StakeholderTier::Operations, Percentage::from_whole(25)?),
                PolicyTier::new(StakeholderTier::EnergyProvider, Percentage::from_whole(10)?),
                PolicyTier::new(StakeholderTier::LoyaltyPool, Percentage::from_whole(5)?),
            ],
        )
    }

    /// Check the structural rules of the policy
    pub fn validate(&self) -> LedgerResult<()> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation(
                "Policy ID cannot be empty".to_string(),
            ));
        }

        if self.tiers.is_empty() {
            return Err(LedgerError::Validation(format!(
                "Policy '{}' has no tiers",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        let mut total = Percentage::ZERO;
        for tier in &self.tiers {
            if !seen.insert(tier.tier) {
                return Err(LedgerError::Validation(format!(
                    "Policy '{}' lists tier '{}' more than once",
                    self.id, tier.tier
                )));
            }
            if tier.share.is_zero() {
                return Err(LedgerError::Validation(format!(
                    "Policy '{}' gives tier '{}' a zero share",
                    self.id, tier.tier
                )));
            }
            if tier.tier == StakeholderTier::Investor && tier.beneficiary_owner_id.is_some() {
                return Err(LedgerError::Validation(
                    "The investor tier is prorated across tokens and cannot name a beneficiary"
                        .to_string(),
                ));
            }
            total = total.checked_add(tier.share).map_err(|_| {
                LedgerError::Validation(format!("Policy '{}' shares exceed 100%", self.id))
            })?;
        }

        if total != Percentage::HUNDRED {
            return Err(LedgerError::Validation(format!(
                "Policy '{}' shares sum to {}, expected 100.00%",
                self.id, total
            )));
        }

        if !seen.contains(&StakeholderTier::Investor) {
            return Err(LedgerError::Validation(format!(
                "Policy '{}' has no investor tier",
                self.id
            )));
        }

        Ok(())
    }

    pub fn investor_share(&self) -> Option<Percentage> {
        self.tiers
            .iter()
            .find(|t| t.tier == StakeholderTier::Investor)
            .map(|t| t.share)
    }

    /// Split gross revenue across the tiers.
    ///
    /// Every tier but the last is rounded half to even; the last tier takes
    /// whatever is left so the amounts sum to `gross` exactly.
    pub fn split(&self, gross: Money) -> LedgerResult<Vec<TierAmount>> {
        let (last, leading) = self.tiers.split_last().ok_or_else(|| {
            LedgerError::Validation(format!("Policy '{}' has no tiers", self.id))
        })?;

        let mut amounts = Vec::with_capacity(self.tiers.len());
        let mut allocated = Money::ZERO;
        for tier in leading {
            let amount = gross.percent(tier.share)?;
            allocated = allocated.checked_add(amount)?;
            amounts.push(TierAmount {
                tier: tier.tier,
                share: tier.share,
                amount,
                beneficiary_owner_id: tier.beneficiary_owner_id.clone(),
            });
        }

        let remainder = gross.checked_sub(allocated)?;
        if remainder.is_negative() {
            return Err(LedgerError::InvariantViolation(format!(
                "Tier rounding for policy '{}' overshoots gross revenue {} by {}",
                self.id,
                gross,
                Money::ZERO.checked_sub(remainder)?
            )));
        }
        amounts.push(TierAmount {
            tier: last.tier,
            share: last.share,
            amount: remainder,
            beneficiary_owner_id: last.beneficiary_owner_id.clone(),
        });

        let total = Money::checked_sum(amounts.iter().map(|t| t.amount))?;
        if total != gross {
            return Err(LedgerError::InvariantViolation(format!(
                "Tier amounts sum to {} but gross revenue is {}",
                total, gross
            )));
        }

        Ok(amounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_vehicle_split_matches_reference_example() {
        let policy = DistributionPolicy::vehicle().unwrap();
        let amounts = policy.split(Money::from_major(11_000).unwrap()).unwrap();

        let expected = [5_500, 2_750, 2_200, 550];
        for (tier, major) in amounts.iter().zip(expected) {
            assert_eq!(tier.amount, Money::from_major(major).unwrap());
        }
        assert_eq!(amounts[0].tier, StakeholderTier::Investor);
    }

    #[test]
    fn test_last_tier_absorbs_remainder() {
        let policy = DistributionPolicy::new(
            "thirds".to_string(),
            "Thirds".to_string(),
            vec![
                PolicyTier::new(StakeholderTier::Investor, Percentage::from_bps(3_333).unwrap()),
                PolicyTier::new(StakeholderTier::Rider, Percentage::from_bps(3_333).unwrap()),
                PolicyTier::new(StakeholderTier::Reserve, Percentage::from_bps(3_334).unwrap()),
            ],
        )
        .unwrap();

        let amounts = policy.split(Money::from_minor(100)).unwrap();
        assert_eq!(amounts[0].amount, Money::from_minor(33));
        assert_eq!(amounts[1].amount, Money::from_minor(33));
        assert_eq!(amounts[2].amount, Money::from_minor(34));
    }

    #[test]
    fn test_policy_validation() {
        let short = DistributionPolicy::new(
            "short".to_string(),
            "Short".to_string(),
            vec![
                PolicyTier::new(StakeholderTier::Investor, Percentage::from_whole(50).unwrap()),
                PolicyTier::new(StakeholderTier::Rider, Percentage::from_whole(40).unwrap()),
            ],
        );
        assert!(matches!(short, Err(LedgerError::Validation(_))));

        let no_investor = DistributionPolicy::new(
            "ops".to_string(),
            "Ops only".to_string(),
            vec![PolicyTier::new(StakeholderTier::Operations, Percentage::HUNDRED)],
        );
        assert!(no_investor.is_err());

        let duplicate = DistributionPolicy::new(
            "dup".to_string(),
            "Duplicate".to_string(),
            vec![
                PolicyTier::new(StakeholderTier::Investor, Percentage::from_whole(50).unwrap()),
                PolicyTier::new(StakeholderTier::Investor, Percentage::from_whole(50).unwrap()),
            ],
        );
        assert!(duplicate.is_err());

        let investor_beneficiary = DistributionPolicy::new(
            "bad".to_string(),
            "Bad".to_string(),
            vec![PolicyTier::new(StakeholderTier::Investor, Percentage::HUNDRED)
                .with_beneficiary("someone")],
        );
        assert!(investor_beneficiary.is_err());
    }

    #[test]
    fn test_swap_station_policy() {
        let policy = DistributionPolicy::swap_station().unwrap();
        assert_eq!(policy.investor_share(), Some(Percentage::from_whole(60).unwrap()));
        assert_eq!(policy.tiers.len(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: tier amounts always sum to the gross revenue exactly.
        #[test]
        fn split_is_exact(gross in 1i64..10_000_000_000i64, cut_a in 1u32..5_000u32, cut_b in 1u32..4_000u32) {
            let third = 10_000 - cut_a - cut_b;
            let policy = DistributionPolicy::new(
                "prop".to_string(),
                "Prop".to_string(),
                vec![
                    PolicyTier::new(StakeholderTier::Investor, Percentage::from_bps(cut_a).unwrap()),
                    PolicyTier::new(StakeholderTier::Management, Percentage::from_bps(cut_b).unwrap()),
                    PolicyTier::new(StakeholderTier::Reserve, Percentage::from_bps(third).unwrap()),
                ],
            ).unwrap();

            let gross = Money::from_minor(gross);
            let amounts = policy.split(gross).unwrap();
            let total = Money::checked_sum(amounts.iter().map(|t| t.amount)).unwrap();
            prop_assert_eq!(total, gross);
            prop_assert!(amounts.iter().all(|t| !t.amount.is_negative()));
        }
    }
}
