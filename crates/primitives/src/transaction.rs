//! Transaction types and their consensus serialization.

use emberd_consensus::constants::LOCKTIME_THRESHOLD;
use emberd_consensus::money::Amount;
use emberd_consensus::{ConsensusOptions, Hash256};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const CURRENT_TX_VERSION: i32 = 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub const SEQUENCE_FINAL: u32 = u32::MAX;
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A transaction. The optional `time` field is only on the wire for
/// networks whose `ConsensusOptions` enable transaction timestamps, so
/// serialization takes the options explicitly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn consensus_encode(&self, options: &ConsensusOptions) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, options);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, options: &ConsensusOptions) {
        encoder.write_i32_le(self.version);
        if options.transaction_timestamp {
            encoder.write_u32_le(self.time);
        }
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(
        bytes: &[u8],
        options: &ConsensusOptions,
    ) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder, options)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(
        decoder: &mut Decoder,
        options: &ConsensusOptions,
    ) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let time = if options.transaction_timestamp {
            decoder.read_u32_le()?
        } else {
            0
        };
        let vin_count = decoder.read_varint()? as usize;
        let mut vin = Vec::with_capacity(vin_count);
        for _ in 0..vin_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let vout_count = decoder.read_varint()? as usize;
        let mut vout = Vec::with_capacity(vout_count);
        for _ in 0..vout_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn txid(&self, options: &ConsensusOptions) -> Hash256 {
        sha256d(&self.consensus_encode(options))
    }

    /// Sum of output values, `None` on overflow.
    pub fn total_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            total = total.checked_add(output.value)?;
        }
        Some(total)
    }

    /// Lock-time finality: a lock time below the threshold is a height,
    /// above it a unix timestamp; max-sequence inputs override either.
    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let lock_time = self.lock_time as i64;
        let compare = if lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if lock_time < compare {
            return true;
        }
        self.vin
            .iter()
            .all(|input| input.sequence == TxIn::SEQUENCE_FINAL)
    }
}
