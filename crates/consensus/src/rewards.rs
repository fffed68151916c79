//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Subsidy minted by the coinbase of a block at `height`, halving every
/// `subsidy_halving_interval` blocks until it reaches zero.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if height < 0 {
        return 0;
    }
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}
