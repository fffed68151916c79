//! Proof-of-work target arithmetic and header validation.

pub mod difficulty;
pub mod validation;
