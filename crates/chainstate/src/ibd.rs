//! Initial block download detection.
//!
//! A node is in IBD while its validated chain is clearly behind the
//! network: no tip yet, a tip at or below the last checkpoint, or less
//! accumulated work than the hard-coded minimum. The verdict is cached
//! briefly, and a `false` latches until explicitly reset.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use emberd_consensus::ConsensusParams;
use emberd_storage::KeyValueStore;
use primitive_types::U256;

use crate::state::ChainState;

const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

pub struct InitialBlockDownloadState<S> {
    chain_state: Option<Arc<ChainState<S>>>,
    params: ConsensusParams,
    cache: Mutex<Option<(bool, Instant)>>,
}

impl<S: KeyValueStore> InitialBlockDownloadState<S> {
    pub fn new(chain_state: Option<Arc<ChainState<S>>>, params: ConsensusParams) -> Self {
        Self {
            chain_state,
            params,
            cache: Mutex::new(None),
        }
    }

    pub fn is_initial_block_download(&self) -> bool {
        {
            let cache = self.cache.lock().unwrap();
            match *cache {
                // Leaving IBD is one-way until reset.
                Some((false, _)) => return false,
                Some((true, checked)) if checked.elapsed() < RECHECK_INTERVAL => return true,
                _ => {}
            }
        }
        let verdict = self.evaluate();
        *self.cache.lock().unwrap() = Some((verdict, Instant::now()));
        verdict
    }

    /// Force the verdict, for startup wiring and tests.
    pub fn set_initial_block_download(&self, value: bool) {
        *self.cache.lock().unwrap() = Some((value, Instant::now()));
    }

    fn evaluate(&self) -> bool {
        // Without a chain state there is nothing to sync against.
        let Some(state) = &self.chain_state else {
            return false;
        };
        let tip = match state.best_block() {
            Ok(Some(tip)) => tip,
            _ => return true,
        };
        if tip.height <= self.params.last_checkpoint_height() {
            return true;
        }
        let minimum = U256::from_little_endian(&self.params.minimum_chain_work);
        tip.chainwork_value() < minimum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::{consensus_params, Network};
    use emberd_storage::memory::MemoryStore;

    #[test]
    fn no_chain_state_is_not_ibd() {
        let params = consensus_params(Network::Regtest);
        let ibd: InitialBlockDownloadState<MemoryStore> =
            InitialBlockDownloadState::new(None, params);
        assert!(!ibd.is_initial_block_download());
    }

    #[test]
    fn empty_chain_is_ibd_until_reset() {
        let params = consensus_params(Network::Regtest);
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(ChainState::new(
            Arc::clone(&store),
            params.clone(),
            crate::rules::RuleRegistry::standard(),
        ));
        let ibd = InitialBlockDownloadState::new(Some(state), params);
        assert!(ibd.is_initial_block_download());

        ibd.set_initial_block_download(false);
        assert!(!ibd.is_initial_block_download());
    }
}
