use emberd_consensus::ConsensusParams;
use emberd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    /// The header hash does not meet the target its bits claim.
    HighHash,
    InvalidBits(&'static str),
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::HighHash => write!(f, "pow hash does not meet target"),
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Context-free proof-of-work check: the header hash must be at or below
/// the target encoded in its own `bits`, and that target must be a valid
/// value within the network's pow limit.
pub fn check_proof_of_work(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    let hash_value = U256::from_little_endian(&header.hash());
    if hash_value > target {
        return Err(PowError::HighHash);
    }

    Ok(())
}
