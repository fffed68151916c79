//! Chain state orchestration: header acceptance, block connection and
//! disconnection, and best-chain selection by accumulated work.
//!
//! Two tip pointers are maintained. `best_header` tracks the most-work
//! header seen; `best_block` tracks the fully validated and connected tip.
//! Reorgs close the gap between them by disconnecting to the fork point
//! and reconnecting along the heavier branch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use emberd_consensus::constants::{BIP34_BLOCK_VERSION, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN};
use emberd_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use emberd_pow::difficulty::{block_proof, get_next_work_required, DifficultyError, HeaderInfo};
use emberd_pow::validation::check_proof_of_work;
use emberd_primitives::block::{Block, BlockHeader};
use emberd_primitives::encoding::DecodeError;
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coinview::CoinView;
use crate::deployments::NodeDeployments;
use crate::index::{
    get_skip_height, status_with_block, status_with_failed, status_with_header,
    status_without_block, ChainIndex, ChainTip, HeaderEntry, HeaderReader,
};
use crate::rules::{ConsensusError, RuleContext, RuleRegistry, ValidationFlags};
use crate::undo::BlockUndo;
use crate::utxo::UnspentOutputSet;

const HEADER_CACHE_CAPACITY: usize = 1 << 16;

#[derive(Debug)]
pub enum ChainStateError {
    Consensus(ConsensusError),
    Store(StoreError),
    Decode(DecodeError),
    Difficulty(DifficultyError),
    InvalidHeader(&'static str),
    CorruptIndex(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Consensus(err) => write!(f, "consensus: {err}"),
            ChainStateError::Store(err) => write!(f, "store: {err}"),
            ChainStateError::Decode(err) => write!(f, "decode: {err}"),
            ChainStateError::Difficulty(err) => write!(f, "difficulty: {err}"),
            ChainStateError::InvalidHeader(reason) => write!(f, "invalid header: {reason}"),
            ChainStateError::CorruptIndex(reason) => write!(f, "corrupt index: {reason}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<ConsensusError> for ChainStateError {
    fn from(err: ConsensusError) -> Self {
        Self::Consensus(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<DifficultyError> for ChainStateError {
    fn from(err: DifficultyError) -> Self {
        Self::Difficulty(err)
    }
}

/// Result of one best-chain activation pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReorgOutcome {
    pub disconnected: usize,
    pub connected: usize,
    pub interrupted: bool,
}

pub struct ChainState<S> {
    store: Arc<S>,
    index: ChainIndex<S>,
    coin_view: CoinView<S>,
    params: ConsensusParams,
    rules: RuleRegistry,
    deployments: NodeDeployments,
    header_cache: Mutex<std::collections::HashMap<Hash256, HeaderEntry>>,
    poisoned: Mutex<HashSet<Hash256>>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(store: Arc<S>, params: ConsensusParams, rules: RuleRegistry) -> Self {
        Self {
            index: ChainIndex::new(Arc::clone(&store)),
            coin_view: CoinView::new(Arc::clone(&store)),
            deployments: NodeDeployments::new(params.clone()),
            store,
            params,
            rules,
            header_cache: Mutex::new(std::collections::HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn best_header(&self) -> Result<Option<ChainTip>, ChainStateError> {
        Ok(self.index.best_header()?)
    }

    pub fn best_block(&self) -> Result<Option<ChainTip>, ChainStateError> {
        Ok(self.index.best_block()?)
    }

    /// Seed the index with the genesis block, or recover the header tip
    /// pointer if headers exist but the pointer was lost.
    pub fn initialize(&self, genesis: &Block) -> Result<(), ChainStateError> {
        let hash = genesis.hash();
        if hash != self.params.hash_genesis_block {
            return Err(ChainStateError::InvalidHeader("genesis hash mismatch"));
        }

        if self.index.get_header(&hash)?.is_some() {
            if self.index.best_header()?.is_none() {
                self.recover_best_header()?;
            }
            return Ok(());
        }

        let proof = block_proof(genesis.header.bits).map_err(DifficultyError::Compact)?;
        let entry = HeaderEntry {
            prev_hash: genesis.header.prev_block,
            skip_hash: [0u8; 32],
            height: 0,
            version: genesis.header.version,
            time: genesis.header.time,
            bits: genesis.header.bits,
            chainwork: proof.to_big_endian(),
            status: status_with_block(status_with_header(0)),
        };

        let mut batch = WriteBatch::new();
        self.index.put_header(&mut batch, &hash, &entry);
        self.index.set_height_hash(&mut batch, 0, &hash);
        self.index.set_best_header(&mut batch, &hash);
        self.index.set_best_block(&mut batch, &hash);
        self.store.write_batch(&batch)?;
        self.cache_insert(hash, entry);

        emberd_log::log_info!(
            "initialized chain state at genesis {}",
            hash256_to_hex(&hash),
        );
        Ok(())
    }

    /// Rebuild the `best_header` pointer by scanning every stored header
    /// for the highest accumulated work.
    fn recover_best_header(&self) -> Result<(), ChainStateError> {
        let headers = self.index.scan_headers()?;
        let best = headers
            .iter()
            .filter(|(_, entry)| !entry.is_failed())
            .max_by_key(|(_, entry)| entry.chainwork_value());
        if let Some((hash, entry)) = best {
            let mut batch = WriteBatch::new();
            self.index.set_best_header(&mut batch, hash);
            self.store.write_batch(&batch)?;
            emberd_log::log_warn!(
                "recovered best header {} at height {}",
                hash256_to_hex(hash),
                entry.height,
            );
        }
        Ok(())
    }

    fn cache_insert(&self, hash: Hash256, entry: HeaderEntry) {
        let mut cache = self.header_cache.lock().unwrap();
        if cache.len() >= HEADER_CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(hash, entry);
    }

    fn cached_header(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, StoreError> {
        if let Some(entry) = self.header_cache.lock().unwrap().get(hash) {
            return Ok(Some(entry.clone()));
        }
        match self.index.get_header(hash)? {
            Some(entry) => {
                self.cache_insert(*hash, entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Median of the last eleven header times ending at `hash`.
    pub fn median_time_past(&self, hash: &Hash256) -> Result<i64, ChainStateError> {
        let mut times: Vec<i64> = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut entry = self
            .cached_header(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing header for median"))?;
        loop {
            times.push(entry.time as i64);
            if times.len() == MEDIAN_TIME_SPAN || entry.height == 0 {
                break;
            }
            entry = self
                .cached_header(&entry.prev_hash)?
                .ok_or(ChainStateError::CorruptIndex("broken header chain"))?;
        }
        times.sort_unstable();
        Ok(times[times.len() / 2])
    }

    /// Difficulty the block after `prev_hash` must carry. `None` means the
    /// genesis position.
    pub fn next_work_required(
        &self,
        prev_hash: Option<&Hash256>,
        next_block_time: Option<i64>,
    ) -> Result<u32, ChainStateError> {
        let Some(prev_hash) = prev_hash else {
            return Ok(get_next_work_required(&[], None, &self.params)?);
        };

        let tip = self
            .cached_header(prev_hash)?
            .ok_or(ChainStateError::CorruptIndex("missing header for difficulty"))?;
        let interval = self.params.difficulty_adjustment_interval();
        let oldest = (tip.height as i64 - interval).max(0);

        let mut window: Vec<HeaderInfo> = Vec::with_capacity((interval + 1) as usize);
        let mut entry = tip;
        loop {
            window.push(HeaderInfo {
                height: entry.height as i64,
                time: entry.time as i64,
                bits: entry.bits,
            });
            if (entry.height as i64) == oldest {
                break;
            }
            entry = self
                .cached_header(&entry.prev_hash)?
                .ok_or(ChainStateError::CorruptIndex("broken header chain"))?;
        }
        window.reverse();

        Ok(get_next_work_required(
            &window,
            next_block_time,
            &self.params,
        )?)
    }

    /// Accept one header into the arena after contextual checks. Returns
    /// the header hash; re-insertion of a known header is a no-op.
    pub fn insert_header(
        &self,
        header: &BlockHeader,
        adjusted_time: i64,
        check_pow: bool,
    ) -> Result<Hash256, ChainStateError> {
        let hash = header.hash();
        if let Some(existing) = self.cached_header(&hash)? {
            if existing.is_failed() {
                return Err(ChainStateError::InvalidHeader(
                    "header previously failed validation",
                ));
            }
            return Ok(hash);
        }

        let prev_entry = if hash == self.params.hash_genesis_block {
            None
        } else {
            let prev = self
                .cached_header(&header.prev_block)?
                .ok_or(ChainStateError::Consensus(ConsensusError::InvalidPrevTip))?;
            if prev.is_failed() || self.poisoned.lock().unwrap().contains(&header.prev_block) {
                return Err(ConsensusError::InvalidPrevTip.into());
            }
            Some(prev)
        };

        if check_pow {
            check_proof_of_work(header, &self.params).map_err(ConsensusError::from)?;
        }

        let height = prev_entry.as_ref().map_or(0, |prev| prev.height + 1);
        if prev_entry.is_some() {
            let required =
                self.next_work_required(Some(&header.prev_block), Some(header.time as i64))?;
            if header.bits != required {
                return Err(ConsensusError::BadDiffBits.into());
            }
            let mtp = self.median_time_past(&header.prev_block)?;
            if (header.time as i64) <= mtp {
                return Err(ConsensusError::TimeTooOld.into());
            }
            if (header.time as i64) > adjusted_time + MAX_FUTURE_BLOCK_TIME {
                return Err(ConsensusError::TimeTooNew.into());
            }
            if height >= self.params.bip34_height && header.version < BIP34_BLOCK_VERSION {
                return Err(ConsensusError::BadVersion.into());
            }
        }
        if let Some(expected) = self.params.checkpoint_hash(height) {
            if hash != expected {
                return Err(ConsensusError::CheckpointViolation.into());
            }
        }

        let proof = block_proof(header.bits).map_err(DifficultyError::Compact)?;
        let parent_work = prev_entry
            .as_ref()
            .map(|prev| prev.chainwork_value())
            .unwrap_or_default();
        let chainwork = parent_work
            .checked_add(proof)
            .ok_or(ChainStateError::CorruptIndex("chainwork overflow"))?;

        let skip_hash = if height > 0 {
            self.ancestor_hash(&header.prev_block, get_skip_height(height))?
                .ok_or(ChainStateError::CorruptIndex("skip ancestor missing"))?
        } else {
            [0u8; 32]
        };

        let entry = HeaderEntry {
            prev_hash: header.prev_block,
            skip_hash,
            height,
            version: header.version,
            time: header.time,
            bits: header.bits,
            chainwork: chainwork.to_big_endian(),
            status: status_with_header(0),
        };

        let mut batch = WriteBatch::new();
        self.index.put_header(&mut batch, &hash, &entry);
        let extends_best = match self.index.best_header()? {
            Some(best) => entry.chainwork_value() > best.chainwork_value(),
            None => true,
        };
        if extends_best {
            self.index.set_best_header(&mut batch, &hash);
        }
        self.store.write_batch(&batch)?;
        self.cache_insert(hash, entry);
        Ok(hash)
    }

    /// Validate `block` against the full rule pipeline and connect it to
    /// the active tip. The block must extend the current best block.
    pub fn connect_block(
        &self,
        block: &Block,
        adjusted_time: i64,
        flags: ValidationFlags,
    ) -> Result<ChainTip, ChainStateError> {
        let hash = block.hash();
        if self.poisoned.lock().unwrap().contains(&hash) {
            return Err(ChainStateError::InvalidHeader(
                "block previously failed validation",
            ));
        }

        let entry = match self.cached_header(&hash)? {
            Some(entry) if entry.is_failed() => {
                return Err(ChainStateError::InvalidHeader(
                    "block previously failed validation",
                ));
            }
            Some(entry) => entry,
            None => {
                self.insert_header(&block.header, adjusted_time, flags.check_pow)?;
                self.cached_header(&hash)?
                    .ok_or(ChainStateError::CorruptIndex("header vanished after insert"))?
            }
        };

        let tip = self
            .index
            .best_block()?
            .ok_or(ChainStateError::CorruptIndex("chain state not initialized"))?;
        if block.header.prev_block != tip.hash {
            return Err(ConsensusError::InvalidPrevTip.into());
        }

        let height = entry.height;
        let prev_hash = block.header.prev_block;
        let options = self.params.options.clone();
        let txids: Vec<Hash256> = block
            .transactions
            .iter()
            .map(|tx| tx.txid(&options))
            .collect();
        let skip_validation = !self.params.checkpoints.is_empty()
            && height <= self.params.last_checkpoint_height();

        let median_time_past = self.median_time_past(&prev_hash)?;
        let next_work_required =
            self.next_work_required(Some(&prev_hash), Some(block.header.time as i64))?;
        let deployments = self.deployments.get_flags(self, Some(&prev_hash))?;

        let mut needed: Vec<Hash256> = Vec::new();
        let mut seen: HashSet<Hash256> = HashSet::new();
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.vin {
                if seen.insert(input.prevout.hash) {
                    needed.push(input.prevout.hash);
                }
            }
        }
        let mut coins = UnspentOutputSet::new();
        self.coin_view.load_into(&mut coins, &needed)?;

        let mut ctx = RuleContext {
            block,
            txids: &txids,
            height,
            median_time_past,
            adjusted_time,
            next_work_required,
            skip_validation,
            flags,
            deployments,
            params: &self.params,
            coins: &mut coins,
            undo: Vec::new(),
            total_fees: 0,
            script_checks: Vec::new(),
        };
        let verdict = self.rules.run(&mut ctx);
        let undo = BlockUndo {
            spent: std::mem::take(&mut ctx.undo),
        };
        let total_fees = ctx.total_fees;
        drop(ctx);

        if let Err(err) = verdict {
            self.mark_block_failed(&hash)?;
            return Err(err.into());
        }

        let mut batch = WriteBatch::new();
        self.coin_view.save(&mut batch, &coins);
        batch.put(Column::BlockUndo, hash, undo.encode());
        self.index.set_height_hash(&mut batch, height, &hash);
        let mut connected = entry;
        connected.status = status_with_block(connected.status);
        self.index.put_header(&mut batch, &hash, &connected);
        self.index.set_best_block(&mut batch, &hash);
        self.store.write_batch(&batch)?;
        let chainwork = connected.chainwork;
        self.cache_insert(hash, connected);

        emberd_log::log_debug!(
            "connected block {} height {} txs {} fees {}",
            hash256_to_hex(&hash),
            height,
            block.transactions.len(),
            total_fees,
        );
        Ok(ChainTip {
            hash,
            height,
            chainwork,
        })
    }

    /// Record a block as invalid, in memory and in its header record.
    pub fn mark_block_failed(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.poisoned.lock().unwrap().insert(*hash);
        if let Some(entry) = self.cached_header(hash)? {
            let mut failed = entry;
            failed.status = status_with_failed(failed.status);
            let mut batch = WriteBatch::new();
            self.index.put_header(&mut batch, hash, &failed);
            self.store.write_batch(&batch)?;
            self.cache_insert(*hash, failed);
        }
        emberd_log::log_warn!("marked block {} as failed", hash256_to_hex(hash));
        Ok(())
    }

    /// Detach the current best block, restoring every coin it spent and
    /// deleting every coin it created. Returns the new tip.
    pub fn disconnect_block(&self) -> Result<ChainTip, ChainStateError> {
        let tip = self
            .index
            .best_block()?
            .ok_or(ChainStateError::CorruptIndex("chain state not initialized"))?;
        if tip.height == 0 {
            return Err(ChainStateError::InvalidHeader("cannot disconnect genesis"));
        }
        let entry = self
            .cached_header(&tip.hash)?
            .ok_or(ChainStateError::CorruptIndex("missing tip header"))?;

        let bytes = self
            .store
            .get(Column::Block, &tip.hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block data for tip"))?;
        let block = Block::consensus_decode(&bytes, &self.params.options)?;
        let undo_bytes = self
            .store
            .get(Column::BlockUndo, &tip.hash)?
            .ok_or(ChainStateError::CorruptIndex("missing undo data for tip"))?;
        let undo = BlockUndo::decode(&undo_bytes)?;

        let options = self.params.options.clone();
        let created: Vec<Hash256> = block
            .transactions
            .iter()
            .map(|tx| tx.txid(&options))
            .collect();
        let mut needed: Vec<Hash256> = created.clone();
        let mut seen: HashSet<Hash256> = created.iter().copied().collect();
        for spent in &undo.spent {
            if seen.insert(spent.outpoint.hash) {
                needed.push(spent.outpoint.hash);
            }
        }

        let mut coins = UnspentOutputSet::new();
        self.coin_view.load_into(&mut coins, &needed)?;
        for txid in &created {
            coins.remove(txid);
        }
        for spent in undo.spent.iter().rev() {
            coins.restore(&spent.outpoint, spent.coin.clone());
        }

        let mut batch = WriteBatch::new();
        self.coin_view.save(&mut batch, &coins);
        batch.delete(Column::BlockUndo, tip.hash);
        self.index.clear_height_hash(&mut batch, tip.height);
        let mut detached = entry;
        detached.status = status_without_block(detached.status);
        self.index.put_header(&mut batch, &tip.hash, &detached);
        self.index.set_best_block(&mut batch, &detached.prev_hash);
        self.store.write_batch(&batch)?;
        let prev_hash = detached.prev_hash;
        self.cache_insert(tip.hash, detached);

        let prev = self
            .cached_header(&prev_hash)?
            .ok_or(ChainStateError::CorruptIndex("missing parent header"))?;
        emberd_log::log_debug!(
            "disconnected block {} height {}",
            hash256_to_hex(&tip.hash),
            tip.height,
        );
        Ok(ChainTip {
            hash: prev_hash,
            height: prev.height,
            chainwork: prev.chainwork,
        })
    }

    /// Move the validated tip toward the most-work header chain:
    /// disconnect back to the fork point, then reconnect along the heavier
    /// branch while block data is available. `stop` is polled between
    /// blocks.
    pub fn activate_best_chain(
        &self,
        adjusted_time: i64,
        flags: ValidationFlags,
        stop: &AtomicBool,
    ) -> Result<ReorgOutcome, ChainStateError> {
        let mut outcome = ReorgOutcome::default();
        loop {
            let header_tip = match self.index.best_header()? {
                Some(tip) => tip,
                None => return Ok(outcome),
            };
            let block_tip = self
                .index
                .best_block()?
                .ok_or(ChainStateError::CorruptIndex("chain state not initialized"))?;
            if header_tip.hash == block_tip.hash
                || header_tip.chainwork_value() <= block_tip.chainwork_value()
            {
                return Ok(outcome);
            }

            // Walk the header branch back to the first hash that sits on
            // the active chain.
            let mut pending: Vec<Hash256> = Vec::new();
            let mut cursor = header_tip.hash;
            let fork = loop {
                if self.index.height_hash(self.height_of(&cursor)?)? == Some(cursor) {
                    break cursor;
                }
                pending.push(cursor);
                let entry = self
                    .cached_header(&cursor)?
                    .ok_or(ChainStateError::CorruptIndex("broken header chain"))?;
                if entry.height == 0 {
                    return Err(ChainStateError::CorruptIndex(
                        "header branch does not meet active chain",
                    ));
                }
                cursor = entry.prev_hash;
            };

            let rewind = block_tip.height - self.height_of(&fork)?;
            if rewind > 0 {
                emberd_log::log_info!(
                    "reorganizing: disconnecting {} blocks to fork {}",
                    rewind,
                    hash256_to_hex(&fork),
                );
            }
            let mut tip = block_tip;
            while tip.hash != fork {
                if stop.load(Ordering::Relaxed) {
                    outcome.interrupted = true;
                    return Ok(outcome);
                }
                tip = self.disconnect_block()?;
                outcome.disconnected += 1;
            }

            let mut progressed = false;
            for hash in pending.iter().rev() {
                if stop.load(Ordering::Relaxed) {
                    outcome.interrupted = true;
                    return Ok(outcome);
                }
                let Some(bytes) = self.store.get(Column::Block, hash)? else {
                    // Block data not downloaded yet; connect what we have.
                    return Ok(outcome);
                };
                let block = Block::consensus_decode(&bytes, &self.params.options)?;
                match self.connect_block(&block, adjusted_time, flags) {
                    Ok(_) => {
                        outcome.connected += 1;
                        progressed = true;
                    }
                    Err(ChainStateError::Consensus(err)) => {
                        // The branch is invalid; fall back to the tip we
                        // actually hold and surface the failure.
                        let tip = self
                            .index
                            .best_block()?
                            .ok_or(ChainStateError::CorruptIndex("chain state not initialized"))?;
                        let mut batch = WriteBatch::new();
                        self.index.set_best_header(&mut batch, &tip.hash);
                        self.store.write_batch(&batch)?;
                        return Err(err.into());
                    }
                    Err(err) => return Err(err),
                }
            }
            if !progressed {
                return Ok(outcome);
            }
        }
    }

    fn height_of(&self, hash: &Hash256) -> Result<i32, ChainStateError> {
        Ok(self
            .cached_header(hash)?
            .ok_or(ChainStateError::CorruptIndex("missing header"))?
            .height)
    }
}

impl<S: KeyValueStore> HeaderReader for ChainState<S> {
    fn header_entry(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, StoreError> {
        self.cached_header(hash)
    }

    fn ancestor_hash(&self, hash: &Hash256, height: i32) -> Result<Option<Hash256>, StoreError> {
        if height < 0 {
            return Ok(None);
        }
        let mut cursor = *hash;
        let mut entry = match self.cached_header(&cursor)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if height > entry.height {
            return Ok(None);
        }
        while entry.height > height {
            let skip_height = get_skip_height(entry.height);
            // The skip pointer never lands below its target, so it is safe
            // whenever it does not overshoot past `height`.
            let next = if skip_height >= height && entry.skip_hash != [0u8; 32] {
                entry.skip_hash
            } else {
                entry.prev_hash
            };
            cursor = next;
            entry = match self.cached_header(&cursor)? {
                Some(entry) => entry,
                None => return Ok(None),
            };
        }
        Ok(Some(cursor))
    }
}
