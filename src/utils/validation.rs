//! Validation utilities

use chrono::NaiveDate;

use crate::money::Money;
use crate::traits::*;
use crate::types::*;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: Money) -> LedgerResult<()> {
    if !amount.is_positive() {
        Err(LedgerError::Validation(format!(
            "Amount must be positive, got {}",
            amount
        )))
    } else {
        Ok(())
    }
}

/// Validate an identifier (asset, owner, policy)
pub fn validate_identifier(kind: &str, id: &str) -> LedgerResult<()> {
    if id.trim().is_empty() {
        return Err(LedgerError::Validation(format!("{} cannot be empty", kind)));
    }

    if id.len() > 64 {
        return Err(LedgerError::Validation(format!(
            "{} cannot exceed 64 characters",
            kind
        )));
    }

    // Check for valid characters (alphanumeric, dashes, underscores)
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(LedgerError::Validation(format!(
            "{} can only contain alphanumeric characters, dashes, and underscores",
            kind
        )));
    }

    Ok(())
}

/// Validate an idempotency key or wallet reference
pub fn validate_reference(reference: &str) -> LedgerResult<()> {
    if reference.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Reference cannot be empty".to_string(),
        ));
    }

    if reference.len() > 200 {
        return Err(LedgerError::Validation(
            "Reference cannot exceed 200 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a distribution period of the form `YYYY-MM`
pub fn validate_period(period: &str) -> LedgerResult<NaiveDate> {
    let well_formed = period.len() == 7
        && period.as_bytes()[4] == b'-'
        && period
            .bytes()
            .enumerate()
            .all(|(i, b)| i == 4 || b.is_ascii_digit());

    if !well_formed {
        return Err(LedgerError::Validation(format!(
            "Period '{}' must have the form YYYY-MM",
            period
        )));
    }

    NaiveDate::parse_from_str(&format!("{}-01", period), "%Y-%m-%d").map_err(|_| {
        LedgerError::Validation(format!("Period '{}' is not a valid month", period))
    })
}

/// Enhanced asset validator with identifier and naming checks
pub struct EnhancedAssetValidator;

impl AssetValidator for EnhancedAssetValidator {
    fn validate_asset(&self, asset: &Asset) -> LedgerResult<()> {
        DefaultAssetValidator.validate_asset(asset)?;
        validate_identifier("Asset ID", &asset.id)?;
        validate_identifier("Policy ID", &asset.revenue_policy_id)?;

        if asset.name.trim().is_empty() || asset.name.len() > 100 {
            return Err(LedgerError::Validation(
                "Asset name must be between 1 and 100 characters".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_valuation(&self, asset: &Asset, new_value: Money) -> LedgerResult<()> {
        DefaultAssetValidator.validate_valuation(asset, new_value)?;

        if new_value < asset.min_investment {
            return Err(LedgerError::Validation(format!(
                "Valuation {} would fall below the minimum investment {}",
                new_value, asset.min_investment
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_period() {
        assert_eq!(
            validate_period("2025-01").unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
        );
        assert!(validate_period("2025-13").is_err());
        assert!(validate_period("2025-1").is_err());
        assert!(validate_period("202501").is_err());
        assert!(validate_period("25-01-01").is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("Asset ID", "keke-lagos_01").is_ok());
        assert!(validate_identifier("Asset ID", "").is_err());
        assert!(validate_identifier("Asset ID", "has space").is_err());
        assert!(validate_identifier("Asset ID", &"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_positive_amount() {
        assert!(validate_positive_amount(Money::from_minor(1)).is_ok());
        assert!(validate_positive_amount(Money::ZERO).is_err());
        assert!(validate_positive_amount(Money::from_minor(-1)).is_err());
    }
}
