//! Durable backing view for the unspent-output set.

use std::sync::Arc;

use emberd_consensus::Hash256;
use emberd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::utxo::{UnspentOutputSet, UnspentOutputs};

/// Reads and writes per-txid unspent records in the `Coins` column. The
/// consensus core only ever touches coins through this view, never the
/// store directly.
pub struct CoinView<S> {
    store: Arc<S>,
}

impl<S> Clone for CoinView<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> CoinView<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<UnspentOutputs>, StoreError> {
        match self.store.get(Column::Coins, txid)? {
            Some(bytes) => UnspentOutputs::decode(*txid, &bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    /// Batch fetch. Unknown txids come back as `None` so callers can tell
    /// missing records apart from empty ones.
    pub fn fetch_coins(
        &self,
        txids: &[Hash256],
    ) -> Result<Vec<(Hash256, Option<UnspentOutputs>)>, StoreError> {
        let mut results = Vec::with_capacity(txids.len());
        for txid in txids {
            results.push((*txid, self.get(txid)?));
        }
        Ok(results)
    }

    /// Load the records a working set needs without clobbering anything
    /// already present in it.
    pub fn load_into(
        &self,
        set: &mut UnspentOutputSet,
        txids: &[Hash256],
    ) -> Result<(), StoreError> {
        let mut fetched = Vec::new();
        for txid in txids {
            if set.contains(txid) {
                continue;
            }
            if let Some(record) = self.get(txid)? {
                fetched.push(record);
            }
        }
        set.try_set_coins(fetched);
        Ok(())
    }

    /// Stage every touched record of the working set into `batch`: fully
    /// spent records are deleted, the rest rewritten.
    pub fn save(&self, batch: &mut WriteBatch, set: &UnspentOutputSet) {
        for (txid, record) in set.modified() {
            match record {
                Some(record) => batch.put(Column::Coins, *txid, record.encode()),
                None => batch.delete(Column::Coins, *txid),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::ConsensusOptions;
    use emberd_primitives::outpoint::OutPoint;
    use emberd_primitives::transaction::{Transaction, TxIn, TxOut};
    use emberd_storage::memory::MemoryStore;

    fn sample_tx(value: i64) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x00],
                sequence: TxIn::SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn save_then_fetch_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let view = CoinView::new(Arc::clone(&store));
        let options = ConsensusOptions::default();

        let tx = sample_tx(50);
        let txid = tx.txid(&options);
        let mut set = UnspentOutputSet::new();
        set.update(&tx, txid, 7).expect("connect");

        let mut batch = WriteBatch::new();
        view.save(&mut batch, &set);
        store.write_batch(&batch).expect("commit");

        let fetched = view.get(&txid).expect("get").expect("record");
        assert_eq!(fetched.height, 7);
        assert_eq!(fetched.get(0).map(|out| out.value), Some(50));
        assert_eq!(view.get(&[3u8; 32]).expect("get"), None);
    }

    #[test]
    fn fully_spent_record_is_deleted_on_save() {
        let store = Arc::new(MemoryStore::new());
        let view = CoinView::new(Arc::clone(&store));
        let options = ConsensusOptions::default();

        let tx = sample_tx(11);
        let txid = tx.txid(&options);
        let mut set = UnspentOutputSet::new();
        set.update(&tx, txid, 1).expect("connect");
        let mut batch = WriteBatch::new();
        view.save(&mut batch, &set);
        store.write_batch(&batch).expect("commit");

        let mut set = UnspentOutputSet::new();
        view.load_into(&mut set, &[txid]).expect("load");
        set.spend(&OutPoint::new(txid, 0)).expect("spend");
        let mut batch = WriteBatch::new();
        view.save(&mut batch, &set);
        store.write_batch(&batch).expect("commit");

        assert_eq!(view.get(&txid).expect("get"), None);
    }
}
