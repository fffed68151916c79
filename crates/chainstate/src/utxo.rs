//! In-memory unspent-output working set for block connection.
//!
//! The durable store keeps one record per transaction id holding every
//! still-unspent output of that transaction. A connect operation loads the
//! records its block references into an [`UnspentOutputSet`], mutates them
//! in memory, and flushes the touched records back in one batch.

use std::collections::{HashMap, HashSet};

use emberd_consensus::money::Amount;
use emberd_consensus::Hash256;
use emberd_primitives::encoding::{DecodeError, Decoder, Encoder};
use emberd_primitives::outpoint::OutPoint;
use emberd_primitives::transaction::{Transaction, TxIn, TxOut};

const UNSPENT_RECORD_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoError {
    /// The referenced transaction has no unspent record in the set.
    MissingInput,
    /// The referenced output exists but was already spent.
    AlreadySpent,
    /// The referenced output index is past the end of the record.
    IndexOutOfRange,
    /// Summing input values overflowed the money range.
    ValueOverflow,
}

impl std::fmt::Display for UtxoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UtxoError::MissingInput => write!(f, "referenced output record is missing"),
            UtxoError::AlreadySpent => write!(f, "referenced output is already spent"),
            UtxoError::IndexOutOfRange => write!(f, "referenced output index out of range"),
            UtxoError::ValueOverflow => write!(f, "input value sum out of range"),
        }
    }
}

impl std::error::Error for UtxoError {}

/// A coin removed from the set, with the metadata a later undo needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentCoin {
    pub output: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

/// Unspent outputs of one transaction. Spent slots stay as `None` so output
/// indexes remain stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnspentOutputs {
    pub txid: Hash256,
    pub height: u32,
    pub is_coinbase: bool,
    pub outputs: Vec<Option<TxOut>>,
}

impl UnspentOutputs {
    pub fn from_transaction(tx: &Transaction, txid: Hash256, height: u32) -> Self {
        Self {
            txid,
            height,
            is_coinbase: tx.is_coinbase(),
            outputs: tx.vout.iter().cloned().map(Some).collect(),
        }
    }

    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(|output| output.is_none())
    }

    pub fn get(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(|slot| slot.as_ref())
    }

    /// Take the output at `index` out of the record.
    pub fn spend(&mut self, index: u32) -> Result<TxOut, UtxoError> {
        let slot = self
            .outputs
            .get_mut(index as usize)
            .ok_or(UtxoError::IndexOutOfRange)?;
        slot.take().ok_or(UtxoError::AlreadySpent)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(UNSPENT_RECORD_VERSION);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(out) => {
                    encoder.write_u8(1);
                    encoder.write_i64_le(out.value);
                    encoder.write_var_bytes(&out.script_pubkey);
                }
                None => encoder.write_u8(0),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(txid: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != UNSPENT_RECORD_VERSION {
            return Err(DecodeError::InvalidData("unsupported unspent record version"));
        }
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        let count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            let present = decoder.read_u8()? != 0;
            if present {
                let value = decoder.read_i64_le()?;
                let script_pubkey = decoder.read_var_bytes()?;
                outputs.push(Some(TxOut {
                    value,
                    script_pubkey,
                }));
            } else {
                outputs.push(None);
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            txid,
            height,
            is_coinbase,
            outputs,
        })
    }
}

/// Working set of unspent records, exclusively owned by one in-flight
/// connect or disconnect operation.
#[derive(Default)]
pub struct UnspentOutputSet {
    records: HashMap<Hash256, UnspentOutputs>,
    dirty: HashSet<Hash256>,
}

impl UnspentOutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the output an input references. `None` exactly when the
    /// output does not exist in the set or is already spent; callers treat
    /// that as a missing input.
    pub fn get_output_for(&self, input: &TxIn) -> Option<&TxOut> {
        self.records
            .get(&input.prevout.hash)
            .and_then(|record| record.get(input.prevout.index))
    }

    pub fn have_inputs(&self, tx: &Transaction) -> bool {
        tx.vin.iter().all(|input| self.get_output_for(input).is_some())
    }

    /// Sum of the values this transaction's inputs resolve to. Callers
    /// check `have_inputs` first; a missing input surfaces as an error.
    pub fn get_value_in(&self, tx: &Transaction) -> Result<Amount, UtxoError> {
        let mut total: Amount = 0;
        for input in &tx.vin {
            let output = self.get_output_for(input).ok_or(UtxoError::MissingInput)?;
            total = total
                .checked_add(output.value)
                .ok_or(UtxoError::ValueOverflow)?;
        }
        Ok(total)
    }

    /// Remove one coin from the set, returning it for undo bookkeeping.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<SpentCoin, UtxoError> {
        let record = self
            .records
            .get_mut(&outpoint.hash)
            .ok_or(UtxoError::MissingInput)?;
        let output = record.spend(outpoint.index)?;
        let spent = SpentCoin {
            output,
            height: record.height,
            is_coinbase: record.is_coinbase,
        };
        self.dirty.insert(outpoint.hash);
        Ok(spent)
    }

    /// Apply one transaction: spend its inputs (non-coinbase only), then
    /// insert a fresh record for its outputs. Applied in block order so
    /// later transactions can spend earlier ones in the same block.
    pub fn update(
        &mut self,
        tx: &Transaction,
        txid: Hash256,
        height: u32,
    ) -> Result<Vec<(OutPoint, SpentCoin)>, UtxoError> {
        let mut spent = Vec::new();
        if !tx.is_coinbase() {
            spent.reserve(tx.vin.len());
            for input in &tx.vin {
                let coin = self.spend(&input.prevout)?;
                spent.push((input.prevout, coin));
            }
        }
        self.records
            .insert(txid, UnspentOutputs::from_transaction(tx, txid, height));
        self.dirty.insert(txid);
        Ok(spent)
    }

    /// Bulk load of records fetched from the backing view. Overwrites any
    /// existing record with the same txid.
    pub fn set_coins(&mut self, coins: Vec<UnspentOutputs>) {
        for record in coins {
            self.records.insert(record.txid, record);
        }
    }

    /// Like `set_coins` but keeps an already-loaded record when the txid is
    /// present, so refetches never clobber in-flight mutations.
    pub fn try_set_coins(&mut self, coins: Vec<UnspentOutputs>) {
        for record in coins {
            self.records.entry(record.txid).or_insert(record);
        }
    }

    /// Put a previously spent coin back, growing the record if needed.
    /// Used when replaying undo data during a disconnect.
    pub fn restore(&mut self, outpoint: &OutPoint, coin: SpentCoin) {
        let record = self
            .records
            .entry(outpoint.hash)
            .or_insert_with(|| UnspentOutputs {
                txid: outpoint.hash,
                height: coin.height,
                is_coinbase: coin.is_coinbase,
                outputs: Vec::new(),
            });
        record.height = coin.height;
        record.is_coinbase = coin.is_coinbase;
        let index = outpoint.index as usize;
        if record.outputs.len() <= index {
            record.outputs.resize(index + 1, None);
        }
        record.outputs[index] = Some(coin.output);
        self.dirty.insert(outpoint.hash);
    }

    /// Drop a whole record, marking the txid for deletion on save.
    pub fn remove(&mut self, txid: &Hash256) {
        self.records.remove(txid);
        self.dirty.insert(*txid);
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.records.contains_key(txid)
    }

    pub fn record(&self, txid: &Hash256) -> Option<&UnspentOutputs> {
        self.records.get(txid)
    }

    /// Touched records, in no particular order: `None` means the record
    /// should be deleted from the backing store.
    pub fn modified(&self) -> impl Iterator<Item = (&Hash256, Option<&UnspentOutputs>)> {
        self.dirty.iter().map(move |txid| {
            let record = self.records.get(txid).filter(|rec| !rec.is_fully_spent());
            (txid, record)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberd_consensus::ConsensusOptions;

    fn coinbase(height: u32) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![height as u8, 0x00],
                sequence: TxIn::SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend_tx(prev: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout: prev,
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x52],
            }],
            lock_time: 0,
        }
    }

    fn txid(tx: &Transaction) -> Hash256 {
        tx.txid(&ConsensusOptions::default())
    }

    #[test]
    fn spend_marks_slot_and_double_spend_errors() {
        let tx = coinbase(1);
        let id = txid(&tx);
        let mut set = UnspentOutputSet::new();
        set.set_coins(vec![UnspentOutputs::from_transaction(&tx, id, 1)]);

        let outpoint = OutPoint::new(id, 0);
        let coin = set.spend(&outpoint).expect("first spend");
        assert_eq!(coin.output.value, 50);
        assert_eq!(coin.height, 1);
        assert!(coin.is_coinbase);
        assert_eq!(set.spend(&outpoint), Err(UtxoError::AlreadySpent));
        assert_eq!(
            set.spend(&OutPoint::new(id, 9)),
            Err(UtxoError::IndexOutOfRange)
        );
    }

    #[test]
    fn get_output_for_is_none_for_missing_and_spent() {
        let tx = coinbase(1);
        let id = txid(&tx);
        let mut set = UnspentOutputSet::new();
        set.set_coins(vec![UnspentOutputs::from_transaction(&tx, id, 1)]);

        let spender = spend_tx(OutPoint::new(id, 0), 40);
        assert!(set.have_inputs(&spender));
        assert_eq!(set.get_value_in(&spender), Ok(50));

        set.spend(&spender.vin[0].prevout).expect("spend");
        assert!(set.get_output_for(&spender.vin[0]).is_none());
        assert!(!set.have_inputs(&spender));
        assert_eq!(set.get_value_in(&spender), Err(UtxoError::MissingInput));

        let stranger = spend_tx(OutPoint::new([9u8; 32], 0), 1);
        assert!(set.get_output_for(&stranger.vin[0]).is_none());
    }

    #[test]
    fn update_resolves_intra_block_spends() {
        let cb = coinbase(5);
        let cb_id = txid(&cb);
        let mut set = UnspentOutputSet::new();
        set.update(&cb, cb_id, 5).expect("connect coinbase");

        let spender = spend_tx(OutPoint::new(cb_id, 0), 49);
        let spender_id = txid(&spender);
        let spent = set.update(&spender, spender_id, 5).expect("connect spender");
        assert_eq!(spent.len(), 1);
        assert_eq!(spent[0].0, OutPoint::new(cb_id, 0));
        assert_eq!(spent[0].1.output.value, 50);

        // The coinbase record is now fully spent and scheduled for delete.
        let modified: HashMap<_, _> = set.modified().map(|(id, rec)| (*id, rec.cloned())).collect();
        assert_eq!(modified.get(&cb_id), Some(&None));
        assert!(modified.get(&spender_id).map(|r| r.is_some()).unwrap_or(false));
    }

    #[test]
    fn try_set_coins_keeps_loaded_records() {
        let tx = coinbase(1);
        let id = txid(&tx);
        let mut set = UnspentOutputSet::new();
        set.set_coins(vec![UnspentOutputs::from_transaction(&tx, id, 1)]);
        set.spend(&OutPoint::new(id, 0)).expect("spend");

        // A refetch of the same txid must not resurrect the spent output.
        set.try_set_coins(vec![UnspentOutputs::from_transaction(&tx, id, 1)]);
        assert!(set
            .get_output_for(&spend_tx(OutPoint::new(id, 0), 1).vin[0])
            .is_none());
    }

    #[test]
    fn restore_round_trips_a_spend() {
        let tx = coinbase(2);
        let id = txid(&tx);
        let mut set = UnspentOutputSet::new();
        set.set_coins(vec![UnspentOutputs::from_transaction(&tx, id, 2)]);

        let outpoint = OutPoint::new(id, 0);
        let coin = set.spend(&outpoint).expect("spend");
        set.remove(&id);
        set.restore(&outpoint, coin);

        let record = set.record(&id).expect("restored record");
        assert_eq!(record.height, 2);
        assert!(record.is_coinbase);
        assert_eq!(record.get(0).map(|out| out.value), Some(50));
    }

    #[test]
    fn record_encoding_round_trips_partially_spent() {
        let tx = Transaction {
            vout: vec![
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 20,
                    script_pubkey: vec![0x52, 0x53],
                },
            ],
            ..coinbase(3)
        };
        let id = txid(&tx);
        let mut record = UnspentOutputs::from_transaction(&tx, id, 3);
        record.spend(0).expect("spend");

        let decoded = UnspentOutputs::decode(id, &record.encode()).expect("decode");
        assert_eq!(decoded, record);
        assert!(decoded.get(0).is_none());
        assert_eq!(decoded.get(1).map(|out| out.value), Some(20));
    }
}
