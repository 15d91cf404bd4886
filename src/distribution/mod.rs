//! Revenue distribution: stakeholder policies and the payout engine

pub mod engine;
pub mod policy;

pub use engine::*;
pub use policy::*;
