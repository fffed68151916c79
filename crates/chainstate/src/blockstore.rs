//! Durable block storage with an optional transaction index.
//!
//! The repository owns the `Block` and `TxIndex` columns and its own tip
//! pointer, which tracks how far block data has been persisted. Chain
//! connection state lives in the header index, not here.

use std::sync::Arc;

use emberd_consensus::{ConsensusOptions, Hash256};
use emberd_primitives::block::Block;
use emberd_primitives::encoding::DecodeError;
use emberd_primitives::transaction::Transaction;
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const META_REPOSITORY_TIP_KEY: &[u8] = b"repo_tip";

#[derive(Debug)]
pub enum BlockStoreError {
    Store(StoreError),
    Decode(DecodeError),
}

impl std::fmt::Display for BlockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStoreError::Store(err) => write!(f, "store: {err}"),
            BlockStoreError::Decode(err) => write!(f, "decode: {err}"),
        }
    }
}

impl std::error::Error for BlockStoreError {}

impl From<StoreError> for BlockStoreError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<DecodeError> for BlockStoreError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

pub struct BlockRepository<S> {
    store: Arc<S>,
    options: ConsensusOptions,
    tx_index: bool,
}

impl<S: KeyValueStore> BlockRepository<S> {
    pub fn new(store: Arc<S>, options: ConsensusOptions, tx_index: bool) -> Self {
        Self {
            store,
            options,
            tx_index,
        }
    }

    /// Store the genesis block and point the repository tip at it, once.
    pub fn initialize(&self, genesis: &Block) -> Result<(), BlockStoreError> {
        if self.block_hash()?.is_some() {
            return Ok(());
        }
        self.put_blocks(genesis.hash(), std::slice::from_ref(genesis))?;
        Ok(())
    }

    /// Hash of the newest block the repository has persisted.
    pub fn block_hash(&self) -> Result<Option<Hash256>, BlockStoreError> {
        match self.store.get(Column::Meta, META_REPOSITORY_TIP_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Backend("malformed repository tip".into()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Move the repository tip without touching block data.
    pub fn set_block_hash(&self, hash: &Hash256) -> Result<(), BlockStoreError> {
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, META_REPOSITORY_TIP_KEY, hash);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, BlockStoreError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(Block::consensus_decode(&bytes, &self.options)?)),
            None => Ok(None),
        }
    }

    /// Look a transaction up through the index. Returns the transaction
    /// and the hash of the block containing it.
    pub fn get_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<(Transaction, Hash256)>, BlockStoreError> {
        if !self.tx_index {
            return Ok(None);
        }
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        let block_hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("malformed tx index entry".into()))?;
        let Some(block) = self.get_block(&block_hash)? else {
            return Ok(None);
        };
        Ok(block
            .transactions
            .into_iter()
            .find(|tx| tx.txid(&self.options) == *txid)
            .map(|tx| (tx, block_hash)))
    }

    /// Persist a batch of blocks and advance the repository tip to
    /// `next_hash` in one atomic write.
    pub fn put_blocks(&self, next_hash: Hash256, blocks: &[Block]) -> Result<(), BlockStoreError> {
        let mut batch = WriteBatch::new();
        for block in blocks {
            let hash = block.hash();
            batch.put(Column::Block, hash, block.consensus_encode(&self.options));
            if self.tx_index {
                for tx in &block.transactions {
                    batch.put(Column::TxIndex, tx.txid(&self.options), hash);
                }
            }
        }
        batch.put(Column::Meta, META_REPOSITORY_TIP_KEY, next_hash);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Remove blocks and their index entries, moving the tip back to
    /// `next_hash`.
    pub fn delete_blocks(
        &self,
        next_hash: Hash256,
        hashes: &[Hash256],
    ) -> Result<(), BlockStoreError> {
        let mut batch = WriteBatch::new();
        for hash in hashes {
            if self.tx_index {
                if let Some(block) = self.get_block(hash)? {
                    for tx in &block.transactions {
                        batch.delete(Column::TxIndex, tx.txid(&self.options));
                    }
                }
            }
            batch.delete(Column::Block, *hash);
        }
        batch.put(Column::Meta, META_REPOSITORY_TIP_KEY, next_hash);
        self.store.write_batch(&batch)?;
        Ok(())
    }
}
