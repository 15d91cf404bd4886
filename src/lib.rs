//! # Fractional Ledger
//!
//! Fractional ownership of shared physical assets (vehicles, batteries,
//! charging cabinets): investor wallets, ownership tokens, atomic purchases
//! and periodic revenue distribution.
//!
//! ## Features
//!
//! - **Exact money**: integer minor units, banker's rounding, no floats
//! - **Wallet ledger**: append-only transaction log with idempotent debits and credits
//! - **Ownership ledger**: per-asset serialised reservation of ownership fractions
//! - **Purchases**: reserve, debit, commit, with compensating rollback and crash recovery
//! - **Revenue distribution**: stakeholder tier split and exact proration to token holders
//! - **Storage abstraction**: database-agnostic design with trait-based storage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fractional_ledger::{FractionalLedger, LedgerConfig, Money, NewAsset, AssetType};
//! use fractional_ledger::utils::MemoryStorage;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = FractionalLedger::bootstrap(MemoryStorage::new(), LedgerConfig::default()).await?;
//! ledger
//!     .register_asset(NewAsset {
//!         id: "keke-01".to_string(),
//!         name: "Keke 01".to_string(),
//!         asset_type: AssetType::Vehicle,
//!         current_value: Money::from_major(100_000)?,
//!         min_investment: Money::from_major(1_000)?,
//!         revenue_policy_id: "vehicle".to_string(),
//!     })
//!     .await?;
//!
//! let wallet = ledger.open_wallet("investor-a").await?;
//! ledger.deposit(&wallet.id, Money::from_major(25_000)?, Money::ZERO, "gw-1").await?;
//! let token = ledger
//!     .purchase("keke-01", "investor-a", Money::from_major(25_000)?, "order-1")
//!     .await?;
//! assert_eq!(token.fraction_owned.to_string(), "25.00%");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod distribution;
pub mod ledger;
pub mod locks;
pub mod money;
pub mod purchase;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::*;
pub use distribution::*;
pub use ledger::*;
pub use money::*;
pub use purchase::*;
pub use traits::*;
pub use types::*;
