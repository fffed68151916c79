//! Versionbits threshold-state tracking.
//!
//! Walks the header arena backwards in confirmation windows and caches the
//! state at each window boundary, so repeated queries along the same chain
//! cost one hash lookup. States come from the schedule in the consensus
//! crate; only the bookkeeping lives here.

use std::collections::HashMap;
use std::sync::Mutex;

use emberd_consensus::constants::{
    MEDIAN_TIME_SPAN, VERSIONBITS_TOP_BITS, VERSIONBITS_TOP_MASK,
};
use emberd_consensus::{
    ConsensusParams, Deployment, DeploymentIndex, Hash256, ThresholdState, ALL_DEPLOYMENTS,
    MAX_DEPLOYMENTS,
};
use emberd_storage::StoreError;

use crate::index::{HeaderEntry, HeaderReader};

/// Resolved deployment states for one block, as seen by the rules.
#[derive(Clone, Copy, Debug)]
pub struct DeploymentFlags {
    pub states: [ThresholdState; MAX_DEPLOYMENTS],
}

impl DeploymentFlags {
    pub fn none() -> Self {
        Self {
            states: [ThresholdState::Defined; MAX_DEPLOYMENTS],
        }
    }

    pub fn is_active(&self, idx: DeploymentIndex) -> bool {
        self.states[idx.as_usize()] == ThresholdState::Active
    }
}

/// Per-deployment state cache keyed by the hash of the last header of
/// the preceding window.
#[derive(Default)]
struct ThresholdConditionCache {
    entries: [HashMap<Hash256, ThresholdState>; MAX_DEPLOYMENTS],
}

pub struct NodeDeployments {
    params: ConsensusParams,
    cache: Mutex<ThresholdConditionCache>,
}

impl NodeDeployments {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            cache: Mutex::new(ThresholdConditionCache::default()),
        }
    }

    /// States of all deployments for a block whose parent is `prev_hash`.
    /// `None` means the block is genesis; everything stays Defined (or
    /// Active for always-on deployments).
    pub fn get_flags(
        &self,
        reader: &dyn HeaderReader,
        prev_hash: Option<&Hash256>,
    ) -> Result<DeploymentFlags, StoreError> {
        let mut states = [ThresholdState::Defined; MAX_DEPLOYMENTS];
        for idx in ALL_DEPLOYMENTS {
            states[idx.as_usize()] = self.state_for(reader, prev_hash, idx)?;
        }
        Ok(DeploymentFlags { states })
    }

    fn state_for(
        &self,
        reader: &dyn HeaderReader,
        prev_hash: Option<&Hash256>,
        idx: DeploymentIndex,
    ) -> Result<ThresholdState, StoreError> {
        let deployment = *self.params.deployment(idx);
        if deployment.start_time == Deployment::ALWAYS_ACTIVE {
            return Ok(ThresholdState::Active);
        }
        if deployment.start_time == Deployment::NEVER_ACTIVE {
            return Ok(ThresholdState::Failed);
        }

        let window = self.params.miner_confirmation_window as i32;
        let threshold = self.params.rule_change_activation_threshold;

        // Align on the last header of the previous window. A block at
        // height h looks at the boundary at h - 1 - ((h - 1 + 1) % window),
        // which is the same ancestor for every block in the window.
        let mut boundary = match prev_hash {
            Some(hash) => {
                let entry = reader
                    .header_entry(hash)?
                    .ok_or_else(|| StoreError::Backend("missing prev header".into()))?;
                let target = entry.height - ((entry.height + 1) % window);
                if target == entry.height {
                    Some((*hash, entry))
                } else if target < 0 {
                    None
                } else {
                    let hash = reader
                        .ancestor_hash(hash, target)?
                        .ok_or_else(|| StoreError::Backend("missing ancestor".into()))?;
                    let entry = reader
                        .header_entry(&hash)?
                        .ok_or_else(|| StoreError::Backend("missing ancestor header".into()))?;
                    Some((hash, entry))
                }
            }
            None => None,
        };

        // Walk back window by window until a cached or terminal boundary.
        let mut to_compute: Vec<(Hash256, HeaderEntry)> = Vec::new();
        let mut state = loop {
            let (hash, entry) = match &boundary {
                Some(pair) => pair.clone(),
                None => break ThresholdState::Defined,
            };
            {
                let cache = self.cache.lock().unwrap();
                if let Some(state) = cache.entries[idx.as_usize()].get(&hash) {
                    break *state;
                }
            }
            if (self.median_time_past(reader, &hash)?) < deployment.start_time {
                break ThresholdState::Defined;
            }
            let target = entry.height - window;
            to_compute.push((hash, entry.clone()));
            boundary = if target < 0 {
                None
            } else {
                let prev = reader
                    .ancestor_hash(&hash, target)?
                    .ok_or_else(|| StoreError::Backend("missing ancestor".into()))?;
                let prev_entry = reader
                    .header_entry(&prev)?
                    .ok_or_else(|| StoreError::Backend("missing ancestor header".into()))?;
                Some((prev, prev_entry))
            };
        };

        // Replay forward, applying the threshold transitions.
        while let Some((hash, entry)) = to_compute.pop() {
            state = match state {
                ThresholdState::Defined => {
                    let mtp = self.median_time_past(reader, &hash)?;
                    if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else if mtp >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    let mtp = self.median_time_past(reader, &hash)?;
                    if mtp >= deployment.timeout {
                        ThresholdState::Failed
                    } else {
                        let signaling =
                            self.count_signaling(reader, &entry, &deployment, window)?;
                        if signaling >= threshold {
                            ThresholdState::LockedIn
                        } else {
                            ThresholdState::Started
                        }
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                terminal => terminal,
            };
            let mut cache = self.cache.lock().unwrap();
            cache.entries[idx.as_usize()].insert(hash, state);
        }

        Ok(state)
    }

    /// Signaling blocks in the window ending at (and including) `entry`.
    fn count_signaling(
        &self,
        reader: &dyn HeaderReader,
        entry: &HeaderEntry,
        deployment: &Deployment,
        window: i32,
    ) -> Result<u32, StoreError> {
        let mask = deployment.mask();
        let mut count = 0u32;
        let mut cursor = entry.clone();
        for _ in 0..window {
            let version = cursor.version as u32;
            if (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS && (version & mask) != 0 {
                count += 1;
            }
            if cursor.height == 0 {
                break;
            }
            cursor = reader
                .header_entry(&cursor.prev_hash)?
                .ok_or_else(|| StoreError::Backend("missing header in window".into()))?;
        }
        Ok(count)
    }

    fn median_time_past(
        &self,
        reader: &dyn HeaderReader,
        hash: &Hash256,
    ) -> Result<i64, StoreError> {
        let mut times: Vec<i64> = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = reader
            .header_entry(hash)?
            .ok_or_else(|| StoreError::Backend("missing header".into()))?;
        loop {
            times.push(cursor.time as i64);
            if times.len() == MEDIAN_TIME_SPAN || cursor.height == 0 {
                break;
            }
            cursor = reader
                .header_entry(&cursor.prev_hash)?
                .ok_or_else(|| StoreError::Backend("missing header".into()))?;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }
}
