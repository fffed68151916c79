//! Hard consensus limits shared across validation.

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;

/// Maximum number of legacy signature operations per block.
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;

/// Confirmations a coinbase output needs before it may be spent.
pub const COINBASE_MATURITY: i32 = 100;

/// Lock times below this value are block heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// Headers may be at most this far ahead of node-adjusted time, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Number of trailing headers used for the median-time-past calculation.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Coinbase scriptSig length bounds.
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Maximum serialized script length accepted by the script checks.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum serialized transaction size in bytes.
pub const MAX_TX_SIZE: u32 = 100_000;

/// Block version that commits the block height in the coinbase scriptSig.
pub const BIP34_BLOCK_VERSION: i32 = 2;

/// Version bits: top three bits that mark a versionbits-signaling header.
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: u32 = 0xe000_0000;
