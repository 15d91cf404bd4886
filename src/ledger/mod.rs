//! Ledger module containing the wallet and ownership ledgers and the facade
//! that ties them together

pub mod core;
pub mod ownership;
pub mod wallet;

pub use self::core::*;
pub use ownership::*;
pub use wallet::*;
