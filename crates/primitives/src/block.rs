//! Block header and block types.

use emberd_consensus::{ConsensusOptions, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_BLOCK_VERSION: i32 = 4;

/// An 80-byte header (plus an optional trailing signature on networks
/// whose `ConsensusOptions` enable block signatures). The hash never
/// covers the signature, matching the signed-header networks' rule that
/// signing must not change the block identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub signature: Vec<u8>,
}

impl BlockHeader {
    pub fn consensus_encode(&self, options: &ConsensusOptions) -> Vec<u8> {
        self.encode_with_signature(options.block_signature)
    }

    fn encode_with_signature(&self, include_signature: bool) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        if include_signature {
            encoder.write_var_bytes(&self.signature);
        }
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.encode_with_signature(false))
    }

    pub fn consensus_decode(
        bytes: &[u8],
        options: &ConsensusOptions,
    ) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder, options)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn decode_from(
        decoder: &mut Decoder,
        options: &ConsensusOptions,
    ) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev_block = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let signature = if options.block_signature {
            decoder.read_var_bytes()?
        } else {
            Vec::new()
        };
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            time,
            bits,
            nonce,
            signature,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self, options: &ConsensusOptions) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.header.consensus_encode(options));
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder, options);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(
        bytes: &[u8],
        options: &ConsensusOptions,
    ) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder, options)?;
        let count = decoder.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder, options)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}
