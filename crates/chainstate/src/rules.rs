//! The consensus rule pipeline.
//!
//! Rules are a closed, ordered registry assembled at startup. Each rule
//! reads (and for the coin-view rule, mutates) a shared [`RuleContext`];
//! the first failure aborts the pipeline. Cheap header checks run before
//! the expensive full-block ones, and rules marked skippable are bypassed
//! for blocks below the last checkpoint.

use std::sync::Arc;

use emberd_consensus::constants::{
    BIP34_BLOCK_VERSION, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_LEN,
    MAX_FUTURE_BLOCK_TIME, MAX_SCRIPT_SIZE, MAX_TX_SIZE, MIN_COINBASE_SCRIPT_LEN,
    COINBASE_MATURITY,
};
use emberd_consensus::money::{money_range, Amount};
use emberd_consensus::{block_subsidy, ConsensusParams, DeploymentIndex, Hash256};
use emberd_pow::validation::{check_proof_of_work, PowError};
use emberd_primitives::block::Block;
use emberd_primitives::hash::sha256d;
use rayon::prelude::*;

use crate::deployments::DeploymentFlags;
use crate::undo::SpentOutput;
use crate::utxo::UnspentOutputSet;

/// Stable consensus failure taxonomy. Every variant has a wire code that
/// never changes once shipped; peers and logs key off it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusError {
    HighHash,
    BadDiffBits,
    TimeTooOld,
    TimeTooNew,
    BadVersion,
    InvalidPrevTip,
    CheckpointViolation,
    BadMerkleRoot,
    BadBlockLength,
    BadBlockSigOps,
    BadCoinbaseMissing,
    BadMultipleCoinbase,
    BadCoinbaseSize,
    BadCoinbaseHeight,
    BadCoinbaseAmount,
    BadTransactionDuplicate,
    BadTransactionNoInput,
    BadTransactionNoOutput,
    BadTransactionOversize,
    BadTransactionNegativeOutput,
    BadTransactionTooLargeOutput,
    BadTransactionTooLargeTotalOutput,
    BadTransactionDuplicateInputs,
    BadTransactionNullPrevout,
    BadTransactionNonFinal,
    BadTransactionMissingInput,
    BadTransactionInBelowOut,
    BadTransactionNegativeFee,
    BadTransactionFeeOutOfRange,
    BadTransactionPrematureCoinbaseSpending,
    BadTransactionInputValueOutOfRange,
    BadTransactionScriptFailure,
}

impl ConsensusError {
    pub fn code(self) -> &'static str {
        match self {
            ConsensusError::HighHash => "high-hash",
            ConsensusError::BadDiffBits => "bad-diffbits",
            ConsensusError::TimeTooOld => "time-too-old",
            ConsensusError::TimeTooNew => "time-too-new",
            ConsensusError::BadVersion => "bad-version",
            ConsensusError::InvalidPrevTip => "invalid-prev-tip",
            ConsensusError::CheckpointViolation => "checkpoint-violation",
            ConsensusError::BadMerkleRoot => "bad-txnmrklroot",
            ConsensusError::BadBlockLength => "bad-blk-length",
            ConsensusError::BadBlockSigOps => "bad-blk-sigops",
            ConsensusError::BadCoinbaseMissing => "bad-cb-missing",
            ConsensusError::BadMultipleCoinbase => "bad-cb-multiple",
            ConsensusError::BadCoinbaseSize => "bad-cb-length",
            ConsensusError::BadCoinbaseHeight => "bad-cb-height",
            ConsensusError::BadCoinbaseAmount => "bad-cb-amount",
            ConsensusError::BadTransactionDuplicate => "bad-txns-duplicate",
            ConsensusError::BadTransactionNoInput => "bad-txns-vin-empty",
            ConsensusError::BadTransactionNoOutput => "bad-txns-vout-empty",
            ConsensusError::BadTransactionOversize => "bad-txns-oversize",
            ConsensusError::BadTransactionNegativeOutput => "bad-txns-vout-negative",
            ConsensusError::BadTransactionTooLargeOutput => "bad-txns-vout-toolarge",
            ConsensusError::BadTransactionTooLargeTotalOutput => "bad-txns-txouttotal-toolarge",
            ConsensusError::BadTransactionDuplicateInputs => "bad-txns-inputs-duplicate",
            ConsensusError::BadTransactionNullPrevout => "bad-txns-prevout-null",
            ConsensusError::BadTransactionNonFinal => "bad-txns-nonfinal",
            ConsensusError::BadTransactionMissingInput => "bad-txns-inputs-missingorspent",
            ConsensusError::BadTransactionInBelowOut => "bad-txns-in-belowout",
            ConsensusError::BadTransactionNegativeFee => "bad-txns-fee-negative",
            ConsensusError::BadTransactionFeeOutOfRange => "bad-txns-fee-outofrange",
            ConsensusError::BadTransactionPrematureCoinbaseSpending => {
                "bad-txns-premature-spend-of-coinbase"
            }
            ConsensusError::BadTransactionInputValueOutOfRange => {
                "bad-txns-inputvalues-outofrange"
            }
            ConsensusError::BadTransactionScriptFailure => "mandatory-script-verify-flag-failed",
        }
    }

    fn description(self) -> &'static str {
        match self {
            ConsensusError::HighHash => "proof of work failed",
            ConsensusError::BadDiffBits => "incorrect proof of work",
            ConsensusError::TimeTooOld => "block timestamp too early",
            ConsensusError::TimeTooNew => "block timestamp too far in the future",
            ConsensusError::BadVersion => "block version rejected",
            ConsensusError::InvalidPrevTip => "invalid previous tip",
            ConsensusError::CheckpointViolation => "block hash conflicts with checkpoint",
            ConsensusError::BadMerkleRoot => "merkle root mismatch",
            ConsensusError::BadBlockLength => "block length limits exceeded",
            ConsensusError::BadBlockSigOps => "out-of-bounds sigop count",
            ConsensusError::BadCoinbaseMissing => "first transaction is not coinbase",
            ConsensusError::BadMultipleCoinbase => "more than one coinbase",
            ConsensusError::BadCoinbaseSize => "coinbase script size out of range",
            ConsensusError::BadCoinbaseHeight => "coinbase does not commit block height",
            ConsensusError::BadCoinbaseAmount => "coinbase pays too much",
            ConsensusError::BadTransactionDuplicate => "duplicate transaction",
            ConsensusError::BadTransactionNoInput => "transaction has no inputs",
            ConsensusError::BadTransactionNoOutput => "transaction has no outputs",
            ConsensusError::BadTransactionOversize => "transaction too large",
            ConsensusError::BadTransactionNegativeOutput => "output value is negative",
            ConsensusError::BadTransactionTooLargeOutput => "output value too large",
            ConsensusError::BadTransactionTooLargeTotalOutput => "total output value too large",
            ConsensusError::BadTransactionDuplicateInputs => "duplicate inputs",
            ConsensusError::BadTransactionNullPrevout => "null prevout in non-coinbase",
            ConsensusError::BadTransactionNonFinal => "transaction is not final",
            ConsensusError::BadTransactionMissingInput => "input missing or already spent",
            ConsensusError::BadTransactionInBelowOut => "inputs below outputs",
            ConsensusError::BadTransactionNegativeFee => "negative fee",
            ConsensusError::BadTransactionFeeOutOfRange => "fee out of range",
            ConsensusError::BadTransactionPrematureCoinbaseSpending => {
                "premature spend of coinbase"
            }
            ConsensusError::BadTransactionInputValueOutOfRange => "input values out of range",
            ConsensusError::BadTransactionScriptFailure => "script verification failed",
        }
    }
}

impl std::fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

impl std::error::Error for ConsensusError {}

impl From<PowError> for ConsensusError {
    fn from(err: PowError) -> Self {
        match err {
            PowError::HighHash => ConsensusError::HighHash,
            PowError::InvalidBits(_) | PowError::Compact(_) => ConsensusError::BadDiffBits,
        }
    }
}

/// Validation toggles chosen by the orchestrator per connect.
#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_scripts: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_scripts: true,
        }
    }
}

/// One resolved input awaiting script verification.
#[derive(Clone, Debug)]
pub struct ScriptCheck {
    pub tx_index: usize,
    pub input_index: usize,
    pub script_sig: Vec<u8>,
    pub script_pubkey: Vec<u8>,
}

/// Seam for script execution. The engine that runs the opcodes lives
/// behind this trait so consensus code stays independent of it.
pub trait ScriptVerifier: Send + Sync {
    fn verify(&self, check: &ScriptCheck) -> bool;
}

/// Structural script sanity: size bounds only. Stands in where a full
/// interpreter is not wired up.
pub struct BasicScriptChecks;

impl ScriptVerifier for BasicScriptChecks {
    fn verify(&self, check: &ScriptCheck) -> bool {
        check.script_sig.len() <= MAX_SCRIPT_SIZE
            && !check.script_pubkey.is_empty()
            && check.script_pubkey.len() <= MAX_SCRIPT_SIZE
    }
}

/// Everything the rules need to validate one block, plus the outputs the
/// coin-view rule accumulates (undo journal, fees, script work).
pub struct RuleContext<'a> {
    pub block: &'a Block,
    pub txids: &'a [Hash256],
    pub height: i32,
    pub median_time_past: i64,
    pub adjusted_time: i64,
    pub next_work_required: u32,
    pub skip_validation: bool,
    pub flags: ValidationFlags,
    pub deployments: DeploymentFlags,
    pub params: &'a ConsensusParams,
    pub coins: &'a mut UnspentOutputSet,
    pub undo: Vec<SpentOutput>,
    pub total_fees: Amount,
    pub script_checks: Vec<ScriptCheck>,
}

pub trait ConsensusRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Skippable rules are bypassed below the last checkpoint. Only the
    /// expensive signature/script class opts in; structural rules never do.
    fn can_skip(&self) -> bool {
        false
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError>;
}

pub struct RuleRegistry {
    rules: Vec<Box<dyn ConsensusRule>>,
}

impl RuleRegistry {
    /// The standard full-validation pipeline, in execution order.
    pub fn standard() -> Self {
        Self::with_script_verifier(Arc::new(BasicScriptChecks))
    }

    pub fn with_script_verifier(verifier: Arc<dyn ScriptVerifier>) -> Self {
        Self {
            rules: vec![
                Box::new(CalculateWorkRule),
                Box::new(HeaderContextRule),
                Box::new(CheckpointRule),
                Box::new(BlockVersionRule),
                Box::new(BlockStructureRule),
                Box::new(MerkleRootRule),
                Box::new(CoinbaseHeightRule),
                Box::new(CoinViewRule),
                Box::new(ScriptVerifyRule { verifier }),
            ],
        }
    }

    pub fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        for rule in &self.rules {
            if ctx.skip_validation && rule.can_skip() {
                continue;
            }
            if let Err(err) = rule.run(ctx) {
                emberd_log::log_debug!(
                    "rule {} rejected block at height {}: {}",
                    rule.name(),
                    ctx.height,
                    err,
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Context-free proof of work, gated on the orchestrator's flag.
pub struct CalculateWorkRule;

impl ConsensusRule for CalculateWorkRule {
    fn name(&self) -> &'static str {
        "calculate-work"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        if ctx.flags.check_pow {
            check_proof_of_work(&ctx.block.header, ctx.params)?;
        }
        Ok(())
    }
}

/// Contextual header checks against the computed difficulty and the
/// time window: claimed bits, median-time-past lower bound, adjusted-time
/// upper bound, in that order.
pub struct HeaderContextRule;

impl ConsensusRule for HeaderContextRule {
    fn name(&self) -> &'static str {
        "header-context"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        let header = &ctx.block.header;
        if header.bits != ctx.next_work_required {
            return Err(ConsensusError::BadDiffBits);
        }
        if (header.time as i64) <= ctx.median_time_past {
            return Err(ConsensusError::TimeTooOld);
        }
        if (header.time as i64) > ctx.adjusted_time + MAX_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::TimeTooNew);
        }
        Ok(())
    }
}

/// The hash at a checkpointed height must match the hard-coded table.
pub struct CheckpointRule;

impl ConsensusRule for CheckpointRule {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        if let Some(expected) = ctx.params.checkpoint_hash(ctx.height) {
            if ctx.block.hash() != expected {
                return Err(ConsensusError::CheckpointViolation);
            }
        }
        Ok(())
    }
}

/// Obsolete block versions are rejected once the height-in-coinbase
/// deployment is reached.
pub struct BlockVersionRule;

impl ConsensusRule for BlockVersionRule {
    fn name(&self) -> &'static str {
        "block-version"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        if ctx.height >= ctx.params.bip34_height && ctx.block.header.version < BIP34_BLOCK_VERSION {
            return Err(ConsensusError::BadVersion);
        }
        Ok(())
    }
}

/// Context-free block and transaction structure: coinbase placement, size
/// and sigop limits, per-transaction sanity, finality, duplicate txids.
pub struct BlockStructureRule;

impl ConsensusRule for BlockStructureRule {
    fn name(&self) -> &'static str {
        "block-structure"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        let block = ctx.block;
        let first = block
            .transactions
            .first()
            .ok_or(ConsensusError::BadCoinbaseMissing)?;
        if !first.is_coinbase() {
            return Err(ConsensusError::BadCoinbaseMissing);
        }
        if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return Err(ConsensusError::BadMultipleCoinbase);
        }

        let options = &ctx.params.options;
        if block.consensus_encode(options).len() > MAX_BLOCK_SIZE as usize {
            return Err(ConsensusError::BadBlockLength);
        }

        let coinbase_script = &first.vin[0].script_sig;
        if coinbase_script.len() < MIN_COINBASE_SCRIPT_LEN
            || coinbase_script.len() > MAX_COINBASE_SCRIPT_LEN
        {
            return Err(ConsensusError::BadCoinbaseSize);
        }

        let lock_time_cutoff = if ctx.deployments.is_active(DeploymentIndex::Csv) {
            ctx.median_time_past
        } else {
            block.header.time as i64
        };

        let mut seen_txids = std::collections::HashSet::with_capacity(ctx.txids.len());
        for (index, tx) in block.transactions.iter().enumerate() {
            if tx.vin.is_empty() {
                return Err(ConsensusError::BadTransactionNoInput);
            }
            if tx.vout.is_empty() {
                return Err(ConsensusError::BadTransactionNoOutput);
            }
            if tx.consensus_encode(options).len() > MAX_TX_SIZE as usize {
                return Err(ConsensusError::BadTransactionOversize);
            }

            let mut total_out: Amount = 0;
            for output in &tx.vout {
                if output.value < 0 {
                    return Err(ConsensusError::BadTransactionNegativeOutput);
                }
                if !money_range(output.value) {
                    return Err(ConsensusError::BadTransactionTooLargeOutput);
                }
                total_out = total_out
                    .checked_add(output.value)
                    .ok_or(ConsensusError::BadTransactionTooLargeTotalOutput)?;
                if !money_range(total_out) {
                    return Err(ConsensusError::BadTransactionTooLargeTotalOutput);
                }
            }

            let mut seen_prevouts = std::collections::HashSet::with_capacity(tx.vin.len());
            for input in &tx.vin {
                if !seen_prevouts.insert(input.prevout) {
                    return Err(ConsensusError::BadTransactionDuplicateInputs);
                }
            }
            if index > 0 && tx.vin.iter().any(|input| input.prevout.is_null()) {
                return Err(ConsensusError::BadTransactionNullPrevout);
            }

            if !tx.is_final(ctx.height, lock_time_cutoff) {
                return Err(ConsensusError::BadTransactionNonFinal);
            }
            if !seen_txids.insert(ctx.txids[index]) {
                return Err(ConsensusError::BadTransactionDuplicate);
            }
        }

        if block_sigops(block) > MAX_BLOCK_SIGOPS {
            return Err(ConsensusError::BadBlockSigOps);
        }
        Ok(())
    }
}

/// Recomputed merkle root must match the header, and the tree must not be
/// a duplicate-subtree mutation of another block.
pub struct MerkleRootRule;

impl ConsensusRule for MerkleRootRule {
    fn name(&self) -> &'static str {
        "merkle-root"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        let (root, mutated) = merkle_root(ctx.txids);
        if mutated {
            return Err(ConsensusError::BadTransactionDuplicate);
        }
        if root != ctx.block.header.merkle_root {
            return Err(ConsensusError::BadMerkleRoot);
        }
        Ok(())
    }
}

/// Height-in-coinbase commitment once the deployment height is reached.
pub struct CoinbaseHeightRule;

impl ConsensusRule for CoinbaseHeightRule {
    fn name(&self) -> &'static str {
        "coinbase-height"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        if ctx.height < ctx.params.bip34_height {
            return Ok(());
        }
        let coinbase = &ctx.block.transactions[0];
        let expected = script_push_int(ctx.height as i64);
        if !coinbase.vin[0].script_sig.starts_with(&expected) {
            return Err(ConsensusError::BadCoinbaseHeight);
        }
        Ok(())
    }
}

/// The full-block rule: resolves every input against the working set,
/// enforces maturity and value balance, caps the coinbase against
/// subsidy plus fees, and applies the block to the set while journaling
/// every spend for undo.
pub struct CoinViewRule;

impl ConsensusRule for CoinViewRule {
    fn name(&self) -> &'static str {
        "coin-view"
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        let height = ctx.height;
        let mut total_fees: Amount = 0;
        let collect_scripts = ctx.flags.check_scripts && !ctx.skip_validation;

        for (tx_index, tx) in ctx.block.transactions.iter().enumerate() {
            if !tx.is_coinbase() {
                let mut value_in: Amount = 0;
                for (input_index, input) in tx.vin.iter().enumerate() {
                    let record = ctx
                        .coins
                        .record(&input.prevout.hash)
                        .ok_or(ConsensusError::BadTransactionMissingInput)?;
                    let output = record
                        .get(input.prevout.index)
                        .ok_or(ConsensusError::BadTransactionMissingInput)?;
                    if record.is_coinbase
                        && height - (record.height as i32) < COINBASE_MATURITY
                    {
                        return Err(
                            ConsensusError::BadTransactionPrematureCoinbaseSpending,
                        );
                    }
                    if !money_range(output.value) {
                        return Err(ConsensusError::BadTransactionInputValueOutOfRange);
                    }
                    value_in = value_in
                        .checked_add(output.value)
                        .ok_or(ConsensusError::BadTransactionInputValueOutOfRange)?;
                    if !money_range(value_in) {
                        return Err(ConsensusError::BadTransactionInputValueOutOfRange);
                    }
                    if collect_scripts {
                        ctx.script_checks.push(ScriptCheck {
                            tx_index,
                            input_index,
                            script_sig: input.script_sig.clone(),
                            script_pubkey: output.script_pubkey.clone(),
                        });
                    }
                }

                let value_out = tx
                    .total_out()
                    .ok_or(ConsensusError::BadTransactionTooLargeTotalOutput)?;
                if value_in < value_out {
                    return Err(ConsensusError::BadTransactionInBelowOut);
                }
                let fee = value_in - value_out;
                if fee < 0 {
                    return Err(ConsensusError::BadTransactionNegativeFee);
                }
                total_fees = total_fees
                    .checked_add(fee)
                    .ok_or(ConsensusError::BadTransactionFeeOutOfRange)?;
                if !money_range(total_fees) {
                    return Err(ConsensusError::BadTransactionFeeOutOfRange);
                }
            }

            let spent = ctx
                .coins
                .update(tx, ctx.txids[tx_index], height as u32)
                .map_err(|_| ConsensusError::BadTransactionMissingInput)?;
            ctx.undo.extend(
                spent
                    .into_iter()
                    .map(|(outpoint, coin)| SpentOutput { outpoint, coin }),
            );
        }

        let coinbase_out = ctx.block.transactions[0]
            .total_out()
            .ok_or(ConsensusError::BadTransactionTooLargeTotalOutput)?;
        let allowed = block_subsidy(height, ctx.params)
            .checked_add(total_fees)
            .ok_or(ConsensusError::BadCoinbaseAmount)?;
        if coinbase_out > allowed {
            return Err(ConsensusError::BadCoinbaseAmount);
        }

        ctx.total_fees = total_fees;
        Ok(())
    }
}

/// Fans the collected script checks across the rayon pool. The only rule
/// in the skippable signature class.
pub struct ScriptVerifyRule {
    pub verifier: Arc<dyn ScriptVerifier>,
}

impl ConsensusRule for ScriptVerifyRule {
    fn name(&self) -> &'static str {
        "script-verify"
    }

    fn can_skip(&self) -> bool {
        true
    }

    fn run(&self, ctx: &mut RuleContext<'_>) -> Result<(), ConsensusError> {
        if !ctx.flags.check_scripts || ctx.script_checks.is_empty() {
            return Ok(());
        }
        let verifier = &self.verifier;
        ctx.script_checks
            .par_iter()
            .try_for_each(|check| -> Result<(), ConsensusError> {
                if verifier.verify(check) {
                    Ok(())
                } else {
                    Err(ConsensusError::BadTransactionScriptFailure)
                }
            })
    }
}

pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && i2 + 1 == size && layer[i] == layer[i2] {
                mutated = true;
            }
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&layer[i]);
            data.extend_from_slice(&layer[i2]);
            next.push(sha256d(&data));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

fn block_sigops(block: &Block) -> u32 {
    block
        .transactions
        .iter()
        .map(|tx| {
            let input_ops: u32 = tx
                .vin
                .iter()
                .map(|input| legacy_sigops(&input.script_sig))
                .sum();
            let output_ops: u32 = tx
                .vout
                .iter()
                .map(|output| legacy_sigops(&output.script_pubkey))
                .sum();
            input_ops + output_ops
        })
        .sum()
}

fn legacy_sigops(script: &[u8]) -> u32 {
    const OP_CHECKSIG: u8 = 0xac;
    const OP_CHECKSIGVERIFY: u8 = 0xad;
    const OP_CHECKMULTISIG: u8 = 0xae;
    const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;

    let mut count = 0u32;
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            0x01..=0x4b => {
                let len = opcode as usize;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA1 => {
                if cursor >= script.len() {
                    break;
                }
                let len = script[cursor] as usize;
                cursor += 1;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            OP_PUSHDATA4 => {
                if cursor + 4 > script.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    script[cursor],
                    script[cursor + 1],
                    script[cursor + 2],
                    script[cursor + 3],
                ]) as usize;
                cursor += 4;
                if cursor + len > script.len() {
                    break;
                }
                cursor += len;
            }
            _ => {}
        }
    }
    count
}

/// Minimal script push of an integer, as the coinbase height commitment
/// requires.
pub fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let data = script_num_to_vec(value);
    let mut script = Vec::with_capacity(data.len() + 1);
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let sign_bit = 0x80u8;
    if let Some(last) = result.last_mut() {
        if (*last & sign_bit) != 0 {
            result.push(if value < 0 { sign_bit } else { 0 });
        } else if value < 0 {
            *last |= sign_bit;
        }
    }
    result
}
