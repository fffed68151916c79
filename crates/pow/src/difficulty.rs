//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use emberd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    InsufficientHistory,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::InsufficientHistory => {
                write!(f, "header list does not reach back to the retarget boundary")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The slice of a header the difficulty algorithm needs.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected hash count a header with these bits represents, as
/// `floor(2^256 / (target + 1))`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Compute the required `bits` for the block following `chain`.
///
/// `chain` must be contiguous by height and end at the current tip. It only
/// has to reach back to the last retarget boundary; callers on a retarget
/// height must supply the full adjustment interval. `next_block_time` feeds
/// the testnet min-difficulty exception and may be `None` elsewhere.
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    next_block_time: Option<i64>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = chain.last() else {
        return Ok(pow_limit_bits);
    };

    ensure_contiguous(chain)?;

    let interval = params.difficulty_adjustment_interval();
    let next_height = last.height + 1;

    if next_height % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            // A block may be mined at minimum difficulty once the chain has
            // stalled for twice the target spacing.
            if let Some(next_time) = next_block_time {
                if next_time > last.time + params.pow_target_spacing * 2 {
                    return Ok(pow_limit_bits);
                }
            }
            // Otherwise reuse the last real difficulty, skipping over any
            // min-difficulty blocks mined under the exception.
            for header in chain.iter().rev() {
                if header.height % interval == 0 || header.bits != pow_limit_bits {
                    return Ok(header.bits);
                }
            }
            return Ok(pow_limit_bits);
        }
        return Ok(last.bits);
    }

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let first_height = next_height - interval;
    let base_height = chain[0].height;
    if first_height < base_height {
        return Err(DifficultyError::InsufficientHistory);
    }
    let first = &chain[(first_height - base_height) as usize];

    Ok(calculate_next_work_required(
        last.bits,
        first.time,
        last.time,
        params,
    )?)
}

fn calculate_next_work_required(
    last_bits: u32,
    first_time: i64,
    last_time: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let target_timespan = params.pow_target_timespan;
    let mut actual_timespan = last_time - first_time;
    if actual_timespan < target_timespan / 4 {
        actual_timespan = target_timespan / 4;
    }
    if actual_timespan > target_timespan * 4 {
        actual_timespan = target_timespan * 4;
    }

    let mut next = compact_to_u256(last_bits)?;
    next = next.saturating_mul(U256::from(actual_timespan as u64));
    next /= U256::from(target_timespan as u64);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if next > pow_limit {
        next = pow_limit;
    }

    Ok(u256_to_compact(next))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as i64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}
