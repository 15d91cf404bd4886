//! Ledger configuration
//!
//! Retry schedule for purchase compensation and construction-time options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{LedgerError, LedgerResult};

/// Retry schedule for releasing a reservation after a failed debit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationPolicy {
    /// Attempts before the purchase is left in `DebitFailed` for recovery
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between attempts
    pub max_backoff_ms: u64,
}

impl Default for CompensationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

impl CompensationPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Top-level configuration of a [`FractionalLedger`](crate::FractionalLedger)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub compensation: CompensationPolicy,
    /// Seed the `vehicle` and `swap_station` policies on bootstrap
    pub register_builtin_policies: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            compensation: CompensationPolicy::default(),
            register_builtin_policies: true,
        }
    }
}

impl LedgerConfig {
    /// Fast retries, for tests
    pub fn for_testing() -> Self {
        Self {
            compensation: CompensationPolicy {
                max_attempts: 5,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            register_builtin_policies: true,
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> LedgerResult<Self> {
        let config: LedgerConfig = serde_json::from_str(json)
            .map_err(|e| LedgerError::Validation(format!("Invalid ledger config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.compensation.max_attempts == 0 {
            return Err(LedgerError::Validation(
                "compensation.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.compensation.initial_backoff_ms > self.compensation.max_backoff_ms {
            return Err(LedgerError::Validation(format!(
                "compensation.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.compensation.initial_backoff_ms, self.compensation.max_backoff_ms
            )));
        }

        Ok(())
    }
}
