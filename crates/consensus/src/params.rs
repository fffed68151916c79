//! Consensus parameter definitions per network.

use crate::deployments::{Deployment, DeploymentIndex, MAX_DEPLOYMENTS};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Serialization switches that the original node kept as process-wide
/// statics. They are explicit values here so validation stays deterministic
/// when networks with different wire formats run in one process.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConsensusOptions {
    /// Headers carry a trailing signature field (proof-of-stake heritage).
    pub block_signature: bool,
    /// Transactions carry a timestamp between version and inputs.
    pub transaction_timestamp: bool,
}

/// A hard-coded trust anchor: the chain at `height` must hash to `hash`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub subsidy_halving_interval: i32,
    /// Height from which the coinbase scriptSig must commit the block height.
    pub bip34_height: i32,
    pub minimum_chain_work: Hash256,
    pub checkpoints: Vec<Checkpoint>,
    /// Confirmation window for versionbits deployments, in blocks.
    pub miner_confirmation_window: u32,
    /// Signaling blocks required within one window to lock a deployment in.
    pub rule_change_activation_threshold: u32,
    pub deployments: [Deployment; MAX_DEPLOYMENTS],
    pub options: ConsensusOptions,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn deployment(&self, idx: DeploymentIndex) -> &Deployment {
        &self.deployments[idx.as_usize()]
    }

    /// Highest height present in the checkpoint table, 0 when empty.
    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn checkpoint_hash(&self, height: i32) -> Option<Hash256> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| checkpoint.hash)
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string has invalid length"),
            HexError::InvalidHex => write!(f, "hex string has invalid characters"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 || hex.len() % 2 == 1 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn hex(input: &str) -> Hash256 {
    hash256_from_hex(input).expect("hard-coded hash")
}

fn mainnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        genesis_time: 1_231_006_505,
        pow_limit: hex("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        subsidy_halving_interval: 210_000,
        bip34_height: 227_931,
        minimum_chain_work: hex(
            "0000000000000000000000000000000000000000002927cdceccbd5209e81e80",
        ),
        checkpoints: mainnet_checkpoints(),
        miner_confirmation_window: 2016,
        rule_change_activation_threshold: 1916,
        deployments: [
            // testdummy
            Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            // csv
            Deployment {
                bit: 0,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
            // segwit
            Deployment {
                bit: 1,
                start_time: 1_479_168_000,
                timeout: 1_510_704_000,
            },
        ],
        options: ConsensusOptions {
            block_signature: false,
            transaction_timestamp: false,
        },
    }
}

fn testnet_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hex(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        genesis_time: 1_296_688_602,
        pow_limit: hex("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        subsidy_halving_interval: 210_000,
        bip34_height: 21_111,
        minimum_chain_work: hex(
            "0000000000000000000000000000000000000000000000198b4def2baa9338d6",
        ),
        checkpoints: testnet_checkpoints(),
        miner_confirmation_window: 2016,
        rule_change_activation_threshold: 1512,
        deployments: [
            Deployment {
                bit: 28,
                start_time: 1_199_145_601,
                timeout: 1_230_767_999,
            },
            Deployment {
                bit: 0,
                start_time: 1_456_790_400,
                timeout: 1_493_596_800,
            },
            Deployment {
                bit: 1,
                start_time: 1_462_060_800,
                timeout: 1_493_596_800,
            },
        ],
        options: ConsensusOptions {
            block_signature: false,
            transaction_timestamp: false,
        },
    }
}

fn regtest_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hex(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        genesis_time: 1_296_688_602,
        pow_limit: hex("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        subsidy_halving_interval: 150,
        bip34_height: 100_000_000,
        minimum_chain_work: [0u8; 32],
        // Regtest chains are throwaway; no trusted history exists.
        checkpoints: Vec::new(),
        miner_confirmation_window: 144,
        rule_change_activation_threshold: 108,
        deployments: [
            Deployment::always(28),
            Deployment::always(0),
            Deployment::always(1),
        ],
        options: ConsensusOptions {
            block_signature: false,
            transaction_timestamp: false,
        },
    }
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hash).expect("checkpoint hash"),
        })
        .collect()
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[
        (
            11_111,
            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
        ),
        (
            33_333,
            "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
        ),
        (
            74_000,
            "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
        ),
        (
            105_000,
            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
        ),
        (
            134_444,
            "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
        ),
        (
            168_000,
            "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
        ),
        (
            193_000,
            "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
        ),
        (
            210_000,
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
        ),
        (
            216_116,
            "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e",
        ),
        (
            225_430,
            "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932",
        ),
        (
            250_000,
            "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
        ),
        (
            279_000,
            "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40",
        ),
        (
            295_000,
            "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
        ),
    ])
}

fn testnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[(
        546,
        "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
    )])
}
