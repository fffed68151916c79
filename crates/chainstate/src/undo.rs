//! Per-block spend journals for disconnects.

use emberd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use emberd_primitives::outpoint::OutPoint;

use crate::utxo::SpentCoin;

const BLOCK_UNDO_VERSION: u8 = 1;

/// One coin consumed while connecting a block, recorded so a disconnect
/// can put back the exact prior unspent state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub coin: SpentCoin,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_u32_le(self.spent.len() as u32);
        for spent in &self.spent {
            spent.outpoint.consensus_encode(&mut encoder);
            encoder.write_i64_le(spent.coin.output.value);
            encoder.write_var_bytes(&spent.coin.output.script_pubkey);
            encoder.write_u32_le(spent.coin.height);
            encoder.write_u8(if spent.coin.is_coinbase { 1 } else { 0 });
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_u32_le()? as usize;
        let mut spent = Vec::with_capacity(count);
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            let height = decoder.read_u32_le()?;
            let is_coinbase = decoder.read_u8()? != 0;
            spent.push(SpentOutput {
                outpoint,
                coin: SpentCoin {
                    output: emberd_primitives::transaction::TxOut {
                        value,
                        script_pubkey,
                    },
                    height,
                    is_coinbase,
                },
            });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}
